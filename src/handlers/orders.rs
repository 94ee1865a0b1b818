//! Order status lookup.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::error::AppError;
use crate::models::order::OrderSnapshot;
use crate::state::AppState;

/// Get the current status snapshot of an order.
///
/// # Response
///
/// Same shape as the `data` of a realtime `order_update`:
///
/// ```json
/// {
///   "transaction_id": "9aed5972-5b6a-401e-894b-a32c91ed1a3a",
///   "order_id": "ORD-1",
///   "payment_status": "settlement",
///   "fulfillment_status": "processing",
///   "serial_number": null,
///   "gross_amount": "10000.00",
///   "payment_type": "qris",
///   "updated_at": "2025-01-01T12:00:05Z"
/// }
/// ```
///
/// Returns 404 if the order does not exist.
pub async fn get_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderSnapshot>, AppError> {
    let order = state
        .store
        .find_order(&order_id)
        .await?
        .ok_or(AppError::OrderNotFound)?;

    Ok(Json(order.snapshot()))
}
