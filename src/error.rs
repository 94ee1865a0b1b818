//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Application-wide error type.
///
/// Every service, store and handler returns this type. Each variant maps to a
/// specific HTTP status code when it reaches a handler boundary.
///
/// # Error Categories
///
/// - **Infrastructure Errors**: database and Redis failures
/// - **Validation Errors**: bad webhook signatures and malformed payloads
/// - **Conflict Errors**: another worker already holds the order's lease
/// - **Insufficient Resource Errors**: the ledger cannot cover an order
/// - **Provider Errors**: network failures, timeouts and unreadable provider responses
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed (e.g., connection error, query error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue backing store or lease store failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Webhook signature does not match the shared secret.
    ///
    /// Returns HTTP 401 Unauthorized.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Request body or parameters are invalid.
    ///
    /// Returns HTTP 400 Bad Request.
    /// The String contains details about what was invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No order exists with the given external identifier.
    ///
    /// Returns HTTP 404 Not Found.
    #[error("Order not found")]
    OrderNotFound,

    /// Another worker holds the lease for this order.
    #[error("Lease already held: {0}")]
    LeaseHeld(String),

    /// The application balance cannot cover the order's purchase price.
    #[error("Insufficient balance")]
    InsufficientBalance,

    /// The application profile row holding the balance is missing.
    #[error("Application profile not found")]
    ProfileNotFound,

    /// The provider call did not complete within its timeout.
    #[error("Provider call timed out after {0}s")]
    ProviderTimeout(u64),

    /// The provider call failed at the transport level.
    #[error("Provider network error: {0}")]
    ProviderNetwork(#[from] reqwest::Error),

    /// The provider answered with something that is not a readable response.
    #[error("Provider response error: {0}")]
    ProviderResponse(String),

    /// One fulfillment transition ran past its time bound.
    #[error("Task timed out after {0}s")]
    TaskTimeout(u64),

    /// A background task could not be queued or completed.
    #[error("Task error: {0}")]
    Task(String),
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// All errors return JSON in this format:
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
///
/// # Status Code Mapping
///
/// - `InvalidSignature` → 401 Unauthorized
/// - `OrderNotFound` → 404 Not Found
/// - `InvalidRequest` → 400 Bad Request
/// - `LeaseHeld` → 409 Conflict
/// - `InsufficientBalance` → 422 Unprocessable Entity
/// - everything else → 500 Internal Server Error (hides details from client)
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                self.to_string(),
            ),
            AppError::OrderNotFound => {
                (StatusCode::NOT_FOUND, "order_not_found", self.to_string())
            }
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::LeaseHeld(_) => (StatusCode::CONFLICT, "lease_held", self.to_string()),
            AppError::InsufficientBalance => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "insufficient_balance",
                self.to_string(),
            ),
            ref other => {
                tracing::error!(error = %other, "Request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
