//! Order persistence.
//!
//! `OrderStore` is the only way orchestration and webhook code touches the
//! `orders` table. Every guarded mutation is either a single statement or a
//! single transaction that row-locks the order before looking at its markers:
//!
//! - `debit_order` sets `saldo_debited_at` and decrements the balance together
//! - `refund_order` sets `refunded_at` and credits the balance together
//! - `increment_retry` bumps the counter with `UPDATE ... RETURNING`
//! - `mark_failed` never overwrites a `Sukses` order
//!
//! Locks are always taken order row first, balance row second.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::order::{FulfillmentStatus, Order, OrderUpdate};
use crate::models::product::Product;
use crate::models::webhook::{FulfillmentCallbackUpdate, PaymentUpdate, WebhookSource};
use crate::services::ledger;

/// Result of asking the store to debit an order's purchase price.
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    /// Balance decremented and `saldo_debited_at` set in one commit
    Debited { remaining: Decimal },
    /// The order was debited by an earlier delivery; nothing changed
    AlreadyDebited,
    InsufficientFunds,
    ProfileNotFound,
}

/// Result of asking the store to refund an order.
#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    Refunded { amount: Decimal },
    /// No debit was ever recorded, so there is nothing to return
    NotDebited,
    AlreadyRefunded,
    /// The order reached `Sukses`; its debit is never returned
    Fulfilled,
    ProfileNotFound,
}

/// Storage seam for orders, products and webhook audit records.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Cheap connectivity check used by the health endpoint.
    async fn ping(&self) -> Result<(), AppError>;

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, AppError>;

    /// Read the order under `SELECT ... FOR UPDATE`, waiting out any
    /// in-flight transition of the same row.
    async fn lock_order(&self, order_id: &str) -> Result<Option<Order>, AppError>;

    async fn find_product(&self, order: &Order) -> Result<Option<Product>, AppError>;

    /// Apply the whitelisted fields of `update`; `None` fields are left as is.
    async fn update_order(&self, order_id: &str, update: &OrderUpdate) -> Result<(), AppError>;

    /// Increment `retry_count` and return the new value.
    async fn increment_retry(&self, order_id: &str) -> Result<i32, AppError>;

    /// Move the order to `failed` unless it is already `Sukses`.
    ///
    /// Returns `false` when nothing was written.
    async fn mark_failed(
        &self,
        order_id: &str,
        message: &str,
        code: Option<&str>,
    ) -> Result<bool, AppError>;

    async fn debit_order(&self, order_id: &str) -> Result<DebitOutcome, AppError>;

    async fn refund_order(&self, order_id: &str) -> Result<RefundOutcome, AppError>;

    /// Persist the exact bytes sent to and received from the provider.
    async fn record_provider_exchange(
        &self,
        order_id: &str,
        request: &[u8],
        response: &[u8],
    ) -> Result<(), AppError>;

    async fn apply_payment_update(
        &self,
        order_id: &str,
        update: &PaymentUpdate,
    ) -> Result<Order, AppError>;

    async fn apply_fulfillment_callback(
        &self,
        order_id: &str,
        update: &FulfillmentCallbackUpdate,
    ) -> Result<Order, AppError>;

    /// Append an inbound webhook body to the audit table.
    async fn record_webhook_event(
        &self,
        source: WebhookSource,
        order_id: Option<&str>,
        payload: &[u8],
        outcome: &str,
    ) -> Result<(), AppError>;
}

/// PostgreSQL-backed `OrderStore`.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const ORDER_COLUMNS: &str = r#"
    id, order_id, product_id, buyer_sku_code, customer_no, transaction_id,
    gross_amount, selling_price, purchase_price, payment_type, payment_status,
    fulfillment_status, status_message, serial_number, provider_ref_id,
    retry_count, last_error_code, saldo_debited_at, refunded_at, sent_at,
    retry_at, created_at, updated_at
"#;

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn lock_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(order)
    }

    async fn find_product(&self, order: &Order) -> Result<Option<Product>, AppError> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, product_name, category, buyer_sku_code, unlimited_stock, stock,
                   start_cut_off, end_cut_off
            FROM products
            WHERE ($1::BIGINT IS NOT NULL AND id = $1)
               OR ($1::BIGINT IS NULL AND buyer_sku_code = $2)
            LIMIT 1
            "#,
        )
        .bind(order.product_id)
        .bind(&order.buyer_sku_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn update_order(&self, order_id: &str, update: &OrderUpdate) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET fulfillment_status = COALESCE($2, fulfillment_status),
                status_message = COALESCE($3, status_message),
                last_error_code = COALESCE($4, last_error_code),
                serial_number = COALESCE($5, serial_number),
                provider_ref_id = COALESCE($6, provider_ref_id),
                sent_at = COALESCE($7, sent_at),
                retry_at = COALESCE($8, retry_at),
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(update.fulfillment_status)
        .bind(&update.status_message)
        .bind(&update.last_error_code)
        .bind(&update.serial_number)
        .bind(&update.provider_ref_id)
        .bind(update.sent_at)
        .bind(update.retry_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::OrderNotFound);
        }

        Ok(())
    }

    async fn increment_retry(&self, order_id: &str) -> Result<i32, AppError> {
        sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE orders
            SET retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE order_id = $1
            RETURNING retry_count
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::OrderNotFound)
    }

    async fn mark_failed(
        &self,
        order_id: &str,
        message: &str,
        code: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET fulfillment_status = $2,
                status_message = $3,
                last_error_code = COALESCE($4, last_error_code),
                updated_at = NOW()
            WHERE order_id = $1
              AND fulfillment_status IS DISTINCT FROM $5
            "#,
        )
        .bind(order_id)
        .bind(FulfillmentStatus::Failed)
        .bind(message)
        .bind(code)
        .bind(FulfillmentStatus::Sukses)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Debit the order's purchase price exactly once.
    ///
    /// # Process
    ///
    /// 1. Begin transaction and lock the order row (FOR UPDATE)
    /// 2. Return `AlreadyDebited` if `saldo_debited_at` is set
    /// 3. Debit the ledger inside the same transaction
    /// 4. Set `saldo_debited_at` and move the order to `processing`
    /// 5. Commit
    ///
    /// A rejected debit rolls the transaction back, so the order is left
    /// exactly as it was.
    async fn debit_order(&self, order_id: &str) -> Result<DebitOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (Decimal, Option<chrono::DateTime<chrono::Utc>>)>(
            "SELECT purchase_price, saldo_debited_at FROM orders WHERE order_id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (purchase_price, debited_at) = row.ok_or(AppError::OrderNotFound)?;
        if debited_at.is_some() {
            return Ok(DebitOutcome::AlreadyDebited);
        }

        let remaining = match ledger::debit(&mut *tx, purchase_price).await {
            Ok(remaining) => remaining,
            Err(AppError::InsufficientBalance) => return Ok(DebitOutcome::InsufficientFunds),
            Err(AppError::ProfileNotFound) => return Ok(DebitOutcome::ProfileNotFound),
            Err(e) => return Err(e),
        };

        sqlx::query(
            r#"
            UPDATE orders
            SET saldo_debited_at = NOW(),
                fulfillment_status = $2,
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(FulfillmentStatus::Processing)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(order_id, %purchase_price, %remaining, "Order debited");

        Ok(DebitOutcome::Debited { remaining })
    }

    /// Credit the order's purchase price back at most once, and never for a
    /// fulfilled order.
    async fn refund_order(&self, order_id: &str) -> Result<RefundOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<
            _,
            (
                Decimal,
                Option<FulfillmentStatus>,
                Option<chrono::DateTime<chrono::Utc>>,
                Option<chrono::DateTime<chrono::Utc>>,
            ),
        >(
            r#"
            SELECT purchase_price, fulfillment_status, saldo_debited_at, refunded_at
            FROM orders
            WHERE order_id = $1
            FOR UPDATE
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (amount, status, debited_at, refunded_at) = row.ok_or(AppError::OrderNotFound)?;
        if status == Some(FulfillmentStatus::Sukses) {
            return Ok(RefundOutcome::Fulfilled);
        }
        if debited_at.is_none() {
            return Ok(RefundOutcome::NotDebited);
        }
        if refunded_at.is_some() {
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        match ledger::credit(&mut *tx, amount).await {
            Ok(_) => {}
            Err(AppError::ProfileNotFound) => return Ok(RefundOutcome::ProfileNotFound),
            Err(e) => return Err(e),
        }

        sqlx::query("UPDATE orders SET refunded_at = NOW(), updated_at = NOW() WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(order_id, %amount, "Order refunded");

        Ok(RefundOutcome::Refunded { amount })
    }

    async fn record_provider_exchange(
        &self,
        order_id: &str,
        request: &[u8],
        response: &[u8],
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE orders
            SET provider_request = $2,
                provider_response = $3,
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(request)
        .bind(response)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_payment_update(
        &self,
        order_id: &str,
        update: &PaymentUpdate,
    ) -> Result<Order, AppError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            UPDATE orders
            SET payment_status = $2,
                status_message = COALESCE($3, status_message),
                transaction_id = COALESCE(transaction_id, $4),
                payment_type = COALESCE(payment_type, $5),
                gross_amount = COALESCE($6, gross_amount),
                payment_callback = $7,
                updated_at = NOW()
            WHERE order_id = $1
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(update.payment_status)
        .bind(&update.status_message)
        .bind(&update.transaction_id)
        .bind(&update.payment_type)
        .bind(update.gross_amount)
        .bind(&update.raw_body)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or(AppError::OrderNotFound)
    }

    async fn apply_fulfillment_callback(
        &self,
        order_id: &str,
        update: &FulfillmentCallbackUpdate,
    ) -> Result<Order, AppError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            UPDATE orders
            SET fulfillment_status = COALESCE($2, fulfillment_status),
                payment_status = COALESCE($3, payment_status),
                status_message = COALESCE($4, status_message),
                serial_number = COALESCE($5, serial_number),
                provider_ref_id = COALESCE($6, provider_ref_id),
                provider_callback = $7,
                updated_at = NOW()
            WHERE order_id = $1
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(update.fulfillment_status)
        .bind(update.payment_status)
        .bind(&update.status_message)
        .bind(&update.serial_number)
        .bind(&update.provider_ref_id)
        .bind(&update.raw_body)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or(AppError::OrderNotFound)
    }

    async fn record_webhook_event(
        &self,
        source: WebhookSource,
        order_id: Option<&str>,
        payload: &[u8],
        outcome: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, source, order_id, payload, outcome)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(source.as_str())
        .bind(order_id)
        .bind(payload)
        .bind(outcome)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
