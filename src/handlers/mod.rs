//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (raw body, headers, URL params)
//! 2. Delegates to a service
//! 3. Returns HTTP response (JSON, status code)

use axum::{
    Router,
    routing::{get, post},
};

use crate::realtime;
use crate::state::AppState;

/// Health check endpoint
pub mod health;
/// Order status lookup
pub mod orders;
/// Payment and provider webhooks
pub mod webhooks;

/// All application routes, without transport layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/callback/payment", post(webhooks::payment_callback))
        .route("/callback/fulfillment", post(webhooks::fulfillment_callback))
        .route("/api/orders/{order_id}", get(orders::get_order_status))
        .route("/ws", get(realtime::ws_handler))
        .with_state(state)
}
