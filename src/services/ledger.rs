//! Balance ledger - atomic adjustment of the application's provider float.
//!
//! This service handles:
//! - Row-locked reads of the single balance record
//! - Balance validation before a debit
//! - Debit and credit applied inside the caller's database transaction
//!
//! # Atomicity Guarantees
//!
//! Both operations take a connection that is already inside a transaction.
//! `SELECT ... FOR UPDATE` holds the balance row until that transaction ends,
//! so the order-side marker (`saldo_debited_at` / `refunded_at`) and the
//! balance change commit or roll back together.

use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::error::AppError;

/// Remove `amount` from the application balance.
///
/// # Process
///
/// 1. Lock the balance row (FOR UPDATE)
/// 2. Validate sufficient balance
/// 3. Write the decremented balance
///
/// # Returns
///
/// The remaining balance after the debit.
///
/// # Errors
///
/// - `ProfileNotFound`: no application profile row exists
/// - `InsufficientBalance`: the balance cannot cover `amount`
/// - `InvalidRequest`: `amount` is negative
/// - `Database`: database error occurred
pub async fn debit(conn: &mut PgConnection, amount: Decimal) -> Result<Decimal, AppError> {
    ensure_non_negative(amount)?;

    let (profile_id, balance) = lock_balance(conn).await?;
    let remaining = remaining_after_debit(balance, amount)?;

    sqlx::query(
        r#"
        UPDATE application_profiles
        SET balance = $1,
            updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(remaining)
    .bind(profile_id)
    .execute(&mut *conn)
    .await?;

    tracing::info!(%balance, %amount, %remaining, "Balance debited");

    Ok(remaining)
}

/// Return `amount` to the application balance.
pub async fn credit(conn: &mut PgConnection, amount: Decimal) -> Result<Decimal, AppError> {
    ensure_non_negative(amount)?;

    let (profile_id, balance) = lock_balance(conn).await?;
    let updated = balance + amount;

    sqlx::query(
        r#"
        UPDATE application_profiles
        SET balance = $1,
            updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(updated)
    .bind(profile_id)
    .execute(&mut *conn)
    .await?;

    tracing::info!(%balance, %amount, %updated, "Balance credited");

    Ok(updated)
}

/// Lock the balance row for the rest of the transaction.
///
/// The application owns exactly one profile row; the lowest id wins if
/// more exist.
async fn lock_balance(conn: &mut PgConnection) -> Result<(i64, Decimal), AppError> {
    sqlx::query_as::<_, (i64, Decimal)>(
        "SELECT id, balance FROM application_profiles ORDER BY id LIMIT 1 FOR UPDATE",
    )
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(AppError::ProfileNotFound)
}

/// Balance left after taking `amount`, rejecting any debit that would go negative.
pub fn remaining_after_debit(balance: Decimal, amount: Decimal) -> Result<Decimal, AppError> {
    if balance < amount {
        return Err(AppError::InsufficientBalance);
    }
    Ok(balance - amount)
}

fn ensure_non_negative(amount: Decimal) -> Result<(), AppError> {
    if amount.is_sign_negative() {
        return Err(AppError::InvalidRequest(
            "Amount must not be negative".to_string(),
        ));
    }
    Ok(())
}
