//! Webhook ingestion for payment notices and provider callbacks.
//!
//! This module verifies inbound webhook signatures, applies the whitelisted
//! order updates each source is allowed to make, records every body in the
//! `webhook_events` audit table, and triggers follow-up work.
//!
//! # Acknowledgement
//!
//! Once the update is durably applied the webhook is acknowledged, even if a
//! follow-up (enqueue, broadcast, refund) fails. Those failures are logged.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::jobs::queue::{Priority, TaskQueue, enqueue_topup};
use crate::models::order::{FulfillmentStatus, PaymentStatus};
use crate::models::webhook::{
    FulfillmentCallback, FulfillmentCallbackUpdate, PaymentNotification, PaymentUpdate,
    WebhookSource,
};
use crate::services::order_store::{OrderStore, RefundOutcome};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Bound on the detached enqueue triggered by a settlement.
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Body returned to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: String,
    pub message: String,
}

/// Handle a payment gateway notification.
///
/// # Process
///
/// 1. Parse the body (malformed bodies are recorded, then rejected)
/// 2. Verify `signature_key`
/// 3. Apply the whitelisted payment update to the order
/// 4. On payment failure, fail the order's fulfillment and refund once
/// 5. Broadcast the new snapshot
/// 6. On settlement, enqueue a topup task in the background
///
/// # Errors
///
/// - `InvalidRequest`: body is not a payment notification
/// - `InvalidSignature`: signature mismatch; nothing is written
/// - `OrderNotFound`: no order with the notice's `order_id`
pub async fn ingest_payment(state: &AppState, body: &[u8]) -> Result<WebhookAck, AppError> {
    let store = state.store.as_ref();

    let notification = match serde_json::from_slice::<PaymentNotification>(body) {
        Ok(notification) => notification,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed payment notification");
            audit(store, WebhookSource::Payment, None, body, "malformed").await;
            return Err(AppError::InvalidRequest("Invalid JSON format".to_string()));
        }
    };

    let order_id = notification.order_id.clone();

    verify_payment_signature(&notification, &state.secrets.payment_server_key).inspect_err(
        |_| tracing::warn!(%order_id, "Invalid payment notification signature"),
    )?;

    let update = payment_update(&notification, body);
    let order = match store.apply_payment_update(&order_id, &update).await {
        Ok(order) => order,
        Err(AppError::OrderNotFound) => {
            audit(store, WebhookSource::Payment, Some(&order_id), body, "order_not_found").await;
            tracing::warn!(%order_id, "Payment notification for unknown order");
            return Err(AppError::OrderNotFound);
        }
        Err(e) => return Err(e),
    };

    audit(
        store,
        WebhookSource::Payment,
        Some(&order_id),
        body,
        update.payment_status.as_str(),
    )
    .await;

    tracing::info!(
        %order_id,
        transaction_status = %notification.transaction_status,
        payment_status = update.payment_status.as_str(),
        "Payment notification applied"
    );

    if update.payment_status == PaymentStatus::Failed && !order.is_terminal() {
        let message = if notification.status_message.is_empty() {
            "Payment failed".to_string()
        } else {
            notification.status_message.clone()
        };
        if let Err(e) = store.mark_failed(&order_id, &message, None).await {
            tracing::error!(%order_id, error = %e, "Failed to mark unpaid order failed");
        }
        refund_once(store, &order_id).await;
    }

    broadcast(state, &order_id).await;

    if update.payment_status == PaymentStatus::Settlement {
        trigger_topup(state.queue.clone(), order_id);
    }

    Ok(WebhookAck {
        status: update.payment_status.as_str().to_string(),
        message: "Notification processed".to_string(),
    })
}

/// Handle a fulfillment provider callback.
///
/// # Process
///
/// 1. Verify `X-Hub-Signature` over the raw body
/// 2. Parse the body (malformed bodies are recorded, then rejected)
/// 3. Apply the whitelisted callback update to the order named by `ref_id`
/// 4. On `Gagal`, refund once
/// 5. Broadcast the new snapshot
pub async fn ingest_fulfillment(
    state: &AppState,
    signature: Option<&str>,
    body: &[u8],
) -> Result<WebhookAck, AppError> {
    let store = state.store.as_ref();

    verify_provider_signature(&state.secrets.provider_webhook_secret, body, signature)
        .inspect_err(|_| tracing::warn!("Invalid provider callback signature"))?;

    let callback = match serde_json::from_slice::<FulfillmentCallback>(body) {
        Ok(callback) => callback,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed provider callback");
            audit(store, WebhookSource::Fulfillment, None, body, "malformed").await;
            return Err(AppError::InvalidRequest("Invalid JSON format".to_string()));
        }
    };

    let order_id = callback.data.ref_id.clone();
    if order_id.is_empty() {
        audit(store, WebhookSource::Fulfillment, None, body, "malformed").await;
        return Err(AppError::InvalidRequest("ref_id is empty".to_string()));
    }

    let update = fulfillment_update(&callback, body);
    match store.apply_fulfillment_callback(&order_id, &update).await {
        Ok(_) => {}
        Err(AppError::OrderNotFound) => {
            audit(store, WebhookSource::Fulfillment, Some(&order_id), body, "order_not_found").await;
            tracing::warn!(%order_id, "Provider callback for unknown order");
            return Err(AppError::OrderNotFound);
        }
        Err(e) => return Err(e),
    }

    audit(
        store,
        WebhookSource::Fulfillment,
        Some(&order_id),
        body,
        &callback.data.status,
    )
    .await;

    tracing::info!(%order_id, status = %callback.data.status, rc = %callback.data.rc, "Provider callback applied");

    if update.fulfillment_status == Some(FulfillmentStatus::Failed) {
        refund_once(store, &order_id).await;
    }

    broadcast(state, &order_id).await;

    Ok(WebhookAck {
        status: "success".to_string(),
        message: "Webhook received".to_string(),
    })
}

/// `hex(sha512(order_id + status_code + gross_amount + server_key))`
pub fn payment_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    hex::encode(payment_digest(order_id, status_code, gross_amount, server_key))
}

fn payment_digest(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hasher.finalize().to_vec()
}

/// Check a payment notice's `signature_key`.
///
/// The comparison runs in constant time. An unset server key rejects every
/// notice rather than skipping the check.
pub fn verify_payment_signature(
    notification: &PaymentNotification,
    server_key: &str,
) -> Result<(), AppError> {
    if server_key.is_empty() {
        tracing::error!("Payment server key is not configured");
        return Err(AppError::InvalidSignature);
    }

    let provided =
        hex::decode(notification.signature_key.trim()).map_err(|_| AppError::InvalidSignature)?;
    let expected = payment_digest(
        &notification.order_id,
        &notification.status_code,
        &notification.gross_amount,
        server_key,
    );

    if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        Ok(())
    } else {
        Err(AppError::InvalidSignature)
    }
}

/// `sha256=<hex(hmac_sha256(secret, body))>`
pub fn provider_signature(secret: &str, body: &[u8]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::InvalidRequest(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check an `X-Hub-Signature` header in constant time.
pub fn verify_provider_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), AppError> {
    let provided = header
        .and_then(|value| value.trim().strip_prefix("sha256="))
        .and_then(|hex_value| hex::decode(hex_value).ok())
        .ok_or(AppError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AppError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| AppError::InvalidSignature)
}

/// Whitelisted fields a payment notice may write.
pub fn payment_update(notification: &PaymentNotification, raw_body: &[u8]) -> PaymentUpdate {
    let gross_amount = notification
        .gross_amount
        .parse::<Decimal>()
        .ok()
        .filter(|amount| *amount > Decimal::ZERO);

    PaymentUpdate {
        payment_status: PaymentStatus::from_gateway(&notification.transaction_status),
        status_message: non_empty(&notification.status_message),
        transaction_id: non_empty(&notification.transaction_id),
        payment_type: non_empty(&notification.payment_type),
        gross_amount,
        raw_body: raw_body.to_vec(),
    }
}

/// Whitelisted fields a provider callback may write.
pub fn fulfillment_update(callback: &FulfillmentCallback, raw_body: &[u8]) -> FulfillmentCallbackUpdate {
    let data = &callback.data;
    let fulfillment_status = FulfillmentStatus::from_provider(&data.status);
    let payment_status = match fulfillment_status {
        Some(FulfillmentStatus::Sukses) => Some(PaymentStatus::Success),
        Some(FulfillmentStatus::Failed) => Some(PaymentStatus::Failed),
        _ => None,
    };

    FulfillmentCallbackUpdate {
        fulfillment_status,
        payment_status,
        status_message: non_empty(&data.message),
        serial_number: non_empty(&data.sn),
        provider_ref_id: non_empty(&data.trx_id),
        raw_body: raw_body.to_vec(),
    }
}

async fn refund_once(store: &dyn OrderStore, order_id: &str) {
    match store.refund_order(order_id).await {
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
        Err(e) => tracing::error!(order_id, error = %e, "Refund failed"),
    }
}

async fn audit(
    store: &dyn OrderStore,
    source: WebhookSource,
    order_id: Option<&str>,
    body: &[u8],
    outcome: &str,
) {
    if let Err(e) = store
        .record_webhook_event(source, order_id, body, outcome)
        .await
    {
        tracing::error!(source = source.as_str(), ?order_id, error = %e, "Failed to record webhook event");
    }
}

async fn broadcast(state: &AppState, order_id: &str) {
    if let Err(e) = state.notifier.broadcast_order_status(order_id).await {
        tracing::warn!(order_id, error = %e, "Status broadcast failed");
    }
}

/// Enqueue a critical-lane topup task without holding up the webhook reply.
fn trigger_topup(queue: Arc<dyn TaskQueue>, order_id: String) {
    tokio::spawn(async move {
        let enqueue = enqueue_topup(queue.as_ref(), &order_id, Priority::Critical);
        match tokio::time::timeout(TRIGGER_TIMEOUT, enqueue).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(%order_id, error = %e, "Failed to enqueue topup"),
            Err(_) => tracing::error!(%order_id, "Timed out enqueueing topup"),
        }
    });
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::webhook::FulfillmentCallbackData;

    fn notification(signature_key: &str) -> PaymentNotification {
        PaymentNotification {
            transaction_id: "trx-1".to_string(),
            order_id: "ORD-1".to_string(),
            payment_type: "qris".to_string(),
            transaction_status: "settlement".to_string(),
            gross_amount: "10000.00".to_string(),
            status_code: "200".to_string(),
            status_message: String::new(),
            signature_key: signature_key.to_string(),
        }
    }

    #[test]
    fn payment_signature_concatenates_fields_in_order() {
        let expected = hex::encode(Sha512::digest(b"ORD-120010000.00SECRET"));
        assert_eq!(payment_signature("ORD-1", "200", "10000.00", "SECRET"), expected);
        assert_eq!(expected.len(), 128);
    }

    #[test]
    fn matching_payment_signature_is_accepted() {
        let signature = payment_signature("ORD-1", "200", "10000.00", "SECRET");
        assert!(verify_payment_signature(&notification(&signature), "SECRET").is_ok());
    }

    #[test]
    fn mismatched_or_unconfigured_payment_signature_is_rejected() {
        let signature = payment_signature("ORD-1", "200", "10000.00", "SECRET");
        assert!(matches!(
            verify_payment_signature(&notification(&signature), "OTHER"),
            Err(AppError::InvalidSignature)
        ));
        assert!(matches!(
            verify_payment_signature(&notification(&signature), ""),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn payment_signature_is_compared_as_digest_bytes() {
        let signature = payment_signature("ORD-1", "200", "10000.00", "SECRET");
        let upper = signature.to_uppercase();
        assert!(verify_payment_signature(&notification(&upper), "SECRET").is_ok());

        let truncated = &signature[..signature.len() - 2];
        assert!(verify_payment_signature(&notification(truncated), "SECRET").is_err());
        assert!(verify_payment_signature(&notification("not-hex"), "SECRET").is_err());
    }

    #[test]
    fn provider_signature_round_trips_through_header_check() {
        let body = br#"{"data":{"ref_id":"ORD-1","status":"Sukses"}}"#;
        let header = provider_signature("hook", body).unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_provider_signature("hook", body, Some(&header)).is_ok());
        assert!(verify_provider_signature("other", body, Some(&header)).is_err());
        assert!(verify_provider_signature("hook", b"{}", Some(&header)).is_err());
        assert!(verify_provider_signature("hook", body, None).is_err());
        assert!(verify_provider_signature("hook", body, Some("sha256=zz")).is_err());
    }

    #[test]
    fn payment_update_ignores_non_positive_amounts() {
        let mut n = notification("");
        n.gross_amount = "0.00".to_string();
        assert_eq!(payment_update(&n, b"{}").gross_amount, None);

        n.gross_amount = "15000".to_string();
        assert_eq!(
            payment_update(&n, b"{}").gross_amount,
            Some(Decimal::new(15000, 0))
        );
    }

    #[test]
    fn gagal_callback_fails_fulfillment_and_payment() {
        let callback = FulfillmentCallback {
            data: FulfillmentCallbackData {
                ref_id: "ORD-1".to_string(),
                trx_id: "BU1".to_string(),
                status: "Gagal".to_string(),
                message: "Nomor tidak valid".to_string(),
                sn: String::new(),
                rc: "44".to_string(),
            },
        };
        let update = fulfillment_update(&callback, b"raw");
        assert_eq!(update.fulfillment_status, Some(FulfillmentStatus::Failed));
        assert_eq!(update.payment_status, Some(PaymentStatus::Failed));
        assert_eq!(update.serial_number, None);
        assert_eq!(update.provider_ref_id.as_deref(), Some("BU1"));
        assert_eq!(update.raw_body, b"raw".to_vec());
    }
}
