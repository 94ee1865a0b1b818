//! Topup orchestrator - drives one order through fulfillment.
//!
//! # State Machine
//!
//! ```text
//! none → pending (not debited) → processing (debited) → Sukses | failed | pending (deferred / retry)
//! ```
//!
//! `Sukses`, `failed` and `cancelled` are terminal. `pending` is re-entered
//! when a product is in its cutoff window or a transient failure is scheduled
//! for retry.
//!
//! # Safety Under Redelivery
//!
//! Tasks are delivered at least once. A second delivery of the same order is
//! harmless because:
//! - the lease keeps two workers from calling the provider concurrently
//! - the order is re-read under `FOR UPDATE` after the lease is taken, so a
//!   transition finished by another worker is seen before anything is sent
//! - `saldo_debited_at` / `refunded_at` make debit and refund one-shot
//! - a `Sukses` order is never refunded or moved to `failed`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};

use crate::error::AppError;
use crate::jobs::backoff::retry_delay;
use crate::models::order::{FulfillmentStatus, Order, OrderUpdate};
use crate::realtime::NotifierHandle;
use crate::services::classifier::{ResponseClass, classify};
use crate::services::fulfillment_client::{FulfillmentClient, ProviderReplyData, timeout_for_category};
use crate::services::lease::{LEASE_TTL, Lease, LeaseLock, lease_key};
use crate::services::order_store::{DebitOutcome, OrderStore, RefundOutcome};

/// Retry count at which an order is failed instead of retried again.
pub const MAX_RETRIES: i32 = 5;

/// Upper bound on one transition, provider call included.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay used for cutoff deferral, unknown codes and unexpected errors.
const LONG_RETRY_MINUTES: i64 = 10;

/// Why an invocation did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OrderNotFound,
    AlreadyTerminal,
    /// Another worker holds the order's lease
    LeaseHeld,
}

/// Result of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TopupOutcome {
    Skipped(SkipReason),
    /// Product is in its cutoff window; nothing was charged or sent
    Deferred { retry_at: DateTime<Utc> },
    /// The order reached `Sukses` or `failed`, or is waiting on a provider callback (`pending`)
    Completed(FulfillmentStatus),
    /// A transient or unrecognized provider answer; try again at `retry_at`
    RetryScheduled {
        retry_count: i32,
        retry_at: DateTime<Utc>,
    },
}

pub struct Orchestrator {
    store: Arc<dyn OrderStore>,
    lease: Arc<dyn LeaseLock>,
    client: Arc<dyn FulfillmentClient>,
    notifier: NotifierHandle,
    cutoff_offset: FixedOffset,
    task_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        lease: Arc<dyn LeaseLock>,
        client: Arc<dyn FulfillmentClient>,
        notifier: NotifierHandle,
        cutoff_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            lease,
            client,
            notifier,
            cutoff_offset,
            task_timeout: TASK_TIMEOUT,
        }
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub async fn process(&self, order_id: &str) -> Result<TopupOutcome, AppError> {
        self.process_at(order_id, Utc::now()).await
    }

    /// Run one fulfillment transition for `order_id` as of `now`.
    ///
    /// # Process
    ///
    /// 1. Load the order; missing or terminal orders are skipped
    /// 2. Acquire the order's lease (a held lease is skipped, not an error),
    ///    then re-read the order under `FOR UPDATE` and skip it if another
    ///    worker finished it in between
    /// 3. Defer if the product is in its cutoff window
    /// 4. Debit the ledger unless already debited
    /// 5. Record `sent_at`, call the provider, persist the raw exchange
    /// 6. Classify the response code and persist the resulting state
    /// 7. Release the lease and broadcast the new snapshot
    ///
    /// Steps 3–6 are bounded by the task timeout.
    ///
    /// # Errors
    ///
    /// An unexpected failure or timeout in steps 3–6 increments the retry
    /// count. Below the maximum the order is set back to `pending` and the
    /// error is returned so the dispatcher can reschedule; at the maximum the
    /// order is failed (with refund) and `Completed(Failed)` is returned instead.
    pub async fn process_at(
        &self,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TopupOutcome, AppError> {
        let (order, lease) = match self.claim(order_id).await? {
            Ok(claimed) => claimed,
            Err(reason) => return Ok(TopupOutcome::Skipped(reason)),
        };

        let result = match tokio::time::timeout(self.task_timeout, self.advance(&order, now)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => self.handle_exception(&order, e, now).await,
            Err(_) => {
                let timeout = AppError::TaskTimeout(self.task_timeout.as_secs());
                self.handle_exception(&order, timeout, now).await
            }
        };

        self.finish(order_id, &lease).await;

        result
    }

    /// Force an order whose task ran out of deliveries into terminal failure.
    pub async fn fail_exhausted(&self, order_id: &str) -> Result<TopupOutcome, AppError> {
        let (_, lease) = match self.claim(order_id).await? {
            Ok(claimed) => claimed,
            Err(reason) => return Ok(TopupOutcome::Skipped(reason)),
        };

        let result = self
            .fail(order_id, "Retry attempts exhausted", "EXHAUSTED")
            .await;

        self.finish(order_id, &lease).await;

        result
    }

    /// Lease a non-terminal order and return its state as read under the lease.
    async fn claim(&self, order_id: &str) -> Result<Result<(Order, Lease), SkipReason>, AppError> {
        let Some(order) = self.store.find_order(order_id).await? else {
            tracing::warn!(order_id, "Topup requested for unknown order");
            return Ok(Err(SkipReason::OrderNotFound));
        };

        if order.is_terminal() {
            tracing::debug!(order_id, status = ?order.fulfillment_status, "Order already terminal");
            return Ok(Err(SkipReason::AlreadyTerminal));
        }

        let Some(lease) = self.try_lease(order_id).await? else {
            return Ok(Err(SkipReason::LeaseHeld));
        };

        let current = match self.store.lock_order(order_id).await {
            Ok(current) => current,
            Err(e) => {
                self.release(&lease).await;
                return Err(e);
            }
        };

        match current {
            Some(order) if !order.is_terminal() => Ok(Ok((order, lease))),
            Some(order) => {
                tracing::info!(order_id, status = ?order.fulfillment_status, "Order finished by another worker");
                self.release(&lease).await;
                Ok(Err(SkipReason::AlreadyTerminal))
            }
            None => {
                self.release(&lease).await;
                Ok(Err(SkipReason::OrderNotFound))
            }
        }
    }

    async fn try_lease(&self, order_id: &str) -> Result<Option<Lease>, AppError> {
        match self.lease.acquire(&lease_key(order_id), LEASE_TTL).await {
            Ok(lease) => Ok(Some(lease)),
            Err(AppError::LeaseHeld(_)) => {
                tracing::info!(order_id, "Order is being processed by another worker");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.lease.release(lease).await {
            tracing::warn!(key = %lease.key, error = %e, "Failed to release lease");
        }
    }

    async fn finish(&self, order_id: &str, lease: &Lease) {
        self.release(lease).await;
        if let Err(e) = self.notifier.broadcast_order_status(order_id).await {
            tracing::debug!(order_id, error = %e, "Status broadcast skipped");
        }
    }

    async fn advance(&self, order: &Order, now: DateTime<Utc>) -> Result<TopupOutcome, AppError> {
        let order_id = order.order_id.as_str();

        let product = self.store.find_product(order).await?;
        match &product {
            Some(product) => {
                let local_time = now.with_timezone(&self.cutoff_offset).time();
                if product.is_in_cutoff(local_time) {
                    let retry_at = now + chrono::Duration::minutes(LONG_RETRY_MINUTES);
                    self.store
                        .update_order(
                            order_id,
                            &OrderUpdate::status(FulfillmentStatus::Pending, "Product in cutoff window")
                                .retry_at(retry_at),
                        )
                        .await?;
                    tracing::info!(order_id, sku = %product.buyer_sku_code, %retry_at, "Product in cutoff, deferring");
                    return Ok(TopupOutcome::Deferred { retry_at });
                }
            }
            None => {
                tracing::warn!(order_id, sku = %order.buyer_sku_code, "Product not found, using default timeout");
            }
        }

        if !order.is_debited() {
            match self.store.debit_order(order_id).await? {
                DebitOutcome::Debited { remaining } => {
                    tracing::info!(order_id, %remaining, "Balance debited for order");
                }
                DebitOutcome::AlreadyDebited => {}
                DebitOutcome::InsufficientFunds => {
                    return self
                        .finalize_failed(order_id, "Insufficient balance", "INSUFF")
                        .await;
                }
                DebitOutcome::ProfileNotFound => {
                    return self
                        .finalize_failed(order_id, "Application profile not found", "NOPROF")
                        .await;
                }
            }
        }

        self.store
            .update_order(
                order_id,
                &OrderUpdate {
                    sent_at: Some(now),
                    ..OrderUpdate::default()
                },
            )
            .await?;

        let timeout = timeout_for_category(product.as_ref().map(|p| p.category.as_str()));
        let exchange = self.client.send(order, timeout).await?;

        self.store
            .record_provider_exchange(order_id, &exchange.request, &exchange.response)
            .await?;

        let reply = exchange.parse()?;
        self.apply_reply(order, reply, now).await
    }

    async fn apply_reply(
        &self,
        order: &Order,
        reply: ProviderReplyData,
        now: DateTime<Utc>,
    ) -> Result<TopupOutcome, AppError> {
        let order_id = order.order_id.as_str();
        let rc = reply.rc.as_str();
        let message = if reply.message.is_empty() {
            "Unknown response".to_string()
        } else {
            reply.message.clone()
        };

        tracing::info!(order_id, rc, %message, "Provider replied");

        match classify(rc) {
            ResponseClass::Success => {
                let update = OrderUpdate {
                    serial_number: non_empty(&reply.sn),
                    provider_ref_id: non_empty(&reply.ref_id),
                    ..OrderUpdate::status(FulfillmentStatus::Sukses, "Transaction succeeded")
                };
                self.store.update_order(order_id, &update).await?;
                tracing::info!(order_id, sn = %reply.sn, "Topup succeeded");
                Ok(TopupOutcome::Completed(FulfillmentStatus::Sukses))
            }
            ResponseClass::Pending => {
                self.store
                    .update_order(order_id, &OrderUpdate::status(FulfillmentStatus::Pending, message))
                    .await?;
                tracing::info!(order_id, "Awaiting provider callback");
                Ok(TopupOutcome::Completed(FulfillmentStatus::Pending))
            }
            ResponseClass::Failed => self.fail(order_id, &message, rc).await,
            ResponseClass::Retryable => {
                let retry_count = self.store.increment_retry(order_id).await?;
                if retry_count >= MAX_RETRIES {
                    return self
                        .fail(order_id, &format!("Failed after {} retries", MAX_RETRIES), rc)
                        .await;
                }

                let retry_at = now + to_chrono(retry_delay(retry_count.max(0) as u32));
                self.store
                    .update_order(
                        order_id,
                        &OrderUpdate::status(FulfillmentStatus::Pending, message)
                            .error_code(rc)
                            .retry_at(retry_at),
                    )
                    .await?;
                tracing::warn!(order_id, rc, retry_count, %retry_at, "Retryable provider response");
                Ok(TopupOutcome::RetryScheduled {
                    retry_count,
                    retry_at,
                })
            }
            ResponseClass::Unknown => {
                let retry_at = now + chrono::Duration::minutes(LONG_RETRY_MINUTES);
                self.store
                    .update_order(
                        order_id,
                        &OrderUpdate::status(FulfillmentStatus::Pending, message)
                            .error_code(rc)
                            .retry_at(retry_at),
                    )
                    .await?;
                tracing::error!(order_id, rc, %retry_at, "Unrecognized provider response code");
                Ok(TopupOutcome::RetryScheduled {
                    retry_count: order.retry_count,
                    retry_at,
                })
            }
        }
    }

    async fn handle_exception(
        &self,
        order: &Order,
        error: AppError,
        now: DateTime<Utc>,
    ) -> Result<TopupOutcome, AppError> {
        let order_id = order.order_id.as_str();
        tracing::error!(order_id, error = %error, "Topup processing failed");

        let retry_count = match self.store.increment_retry(order_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(order_id, error = %e, "Failed to record retry");
                return Err(error);
            }
        };

        if retry_count >= MAX_RETRIES {
            return self
                .fail(order_id, &format!("Error: {}", error), "EXCEPT")
                .await;
        }

        let retry_at = now + chrono::Duration::minutes(LONG_RETRY_MINUTES);
        let update =
            OrderUpdate::status(FulfillmentStatus::Pending, "System disruption").retry_at(retry_at);
        if let Err(e) = self.store.update_order(order_id, &update).await {
            tracing::error!(order_id, error = %e, "Failed to schedule retry");
        }

        Err(error)
    }

    /// Definitive failure: refund once if debited, then persist `failed`.
    ///
    /// A refund problem is logged as an operational alert and never blocks
    /// finalization.
    async fn fail(
        &self,
        order_id: &str,
        message: &str,
        code: &str,
    ) -> Result<TopupOutcome, AppError> {
        match self.store.refund_order(order_id).await {
            Ok(RefundOutcome::Refunded { amount }) => {
                tracing::info!(order_id, %amount, "Balance refunded");
            }
            Ok(RefundOutcome::NotDebited) | Ok(RefundOutcome::AlreadyRefunded) => {}
            Ok(RefundOutcome::Fulfilled) => {
                tracing::warn!(order_id, "Refund refused: order already fulfilled");
            }
            Ok(RefundOutcome::ProfileNotFound) => {
                tracing::error!(order_id, "Refund skipped: application profile not found");
            }
            Err(e) => {
                tracing::error!(order_id, error = %e, "Refund failed");
            }
        }

        self.finalize_failed(order_id, message, code).await
    }

    /// Persist `failed`, unless the order reached `Sukses` meanwhile.
    async fn finalize_failed(
        &self,
        order_id: &str,
        message: &str,
        code: &str,
    ) -> Result<TopupOutcome, AppError> {
        if !self.store.mark_failed(order_id, message, Some(code)).await? {
            tracing::warn!(order_id, code, "Order already fulfilled, failure not recorded");
            return Ok(TopupOutcome::Completed(FulfillmentStatus::Sukses));
        }
        tracing::error!(order_id, code, %message, "Topup failed");
        Ok(TopupOutcome::Completed(FulfillmentStatus::Failed))
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn to_chrono(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::minutes(LONG_RETRY_MINUTES))
}
