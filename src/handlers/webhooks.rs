//! HTTP handlers for inbound webhooks.
//!
//! Both handlers take the raw body so the exact bytes can be verified and
//! recorded before any parsing happens.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};

use crate::error::AppError;
use crate::services::webhook_service::{self, WebhookAck};
use crate::state::AppState;

/// Header carrying the provider's HMAC signature.
pub const PROVIDER_SIGNATURE_HEADER: &str = "x-hub-signature";

/// Payment gateway notification.
///
/// # Request Body
///
/// ```json
/// {
///   "transaction_id": "9aed5972-5b6a-401e-894b-a32c91ed1a3a",
///   "order_id": "ORD-1",
///   "payment_type": "qris",
///   "transaction_status": "settlement",
///   "gross_amount": "10000.00",
///   "status_code": "200",
///   "signature_key": "<sha512 hex>"
/// }
/// ```
///
/// # Response
///
/// ```json
/// { "status": "settlement", "message": "Notification processed" }
/// ```
///
/// - 400 for malformed JSON
/// - 401 for a signature mismatch
/// - 404 when the order does not exist
pub async fn payment_callback(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let ack = webhook_service::ingest_payment(&state, &body).await?;
    Ok(Json(ack))
}

/// Fulfillment provider delivery callback.
///
/// Requires `X-Hub-Signature: sha256=<hex hmac of the body>`.
///
/// # Response
///
/// ```json
/// { "status": "success", "message": "Webhook received" }
/// ```
pub async fn fulfillment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let signature = headers
        .get(PROVIDER_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let ack = webhook_service::ingest_fulfillment(&state, signature, &body).await?;
    Ok(Json(ack))
}
