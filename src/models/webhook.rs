//! Inbound webhook models.
//!
//! This module defines the payloads received from the payment gateway and the
//! fulfillment provider, and the narrow updates each one may apply to an order.
//!
//! # Webhook Flow
//!
//! 1. The raw body is read in full before parsing
//! 2. The signature is checked against the shared secret
//! 3. The order is looked up by its external identifier
//! 4. A whitelisted update is built from the payload and applied
//!
//! # Security
//!
//! - Payment notices are signed with `sha512(order_id + status_code + gross_amount + server_key)`
//! - Provider callbacks carry `X-Hub-Signature: sha256=<hmac>` over the raw body

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::order::{FulfillmentStatus, PaymentStatus};

/// Where an inbound webhook came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookSource {
    Payment,
    Fulfillment,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::Payment => "payment",
            WebhookSource::Fulfillment => "fulfillment",
        }
    }
}

/// Settlement notice sent by the payment gateway.
///
/// # Example
///
/// ```json
/// {
///   "transaction_id": "9aed5972-5b6a-401e-894b-a32c91ed1a3a",
///   "order_id": "ORD-1",
///   "payment_type": "qris",
///   "transaction_status": "settlement",
///   "gross_amount": "10000.00",
///   "status_code": "200",
///   "status_message": "midtrans payment notification",
///   "signature_key": "<sha512 hex>"
/// }
/// ```
///
/// `gross_amount` stays a string so the signature is computed over the exact
/// bytes the gateway signed.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    #[serde(default)]
    pub transaction_id: String,
    pub order_id: String,
    #[serde(default)]
    pub payment_type: String,
    pub transaction_status: String,
    pub gross_amount: String,
    pub status_code: String,
    #[serde(default)]
    pub status_message: String,
    pub signature_key: String,
}

/// Delivery notice sent by the fulfillment provider.
///
/// # Example
///
/// ```json
/// {
///   "data": {
///     "ref_id": "ORD-1",
///     "trx_id": "BU1234",
///     "status": "Sukses",
///     "message": "Transaksi Sukses",
///     "sn": "0412-3456-7890",
///     "rc": "00"
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct FulfillmentCallback {
    pub data: FulfillmentCallbackData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FulfillmentCallbackData {
    /// Our external order identifier
    pub ref_id: String,
    #[serde(default)]
    pub trx_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub sn: String,
    #[serde(default)]
    pub rc: String,
}

/// Fields a payment notice may change on an order.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub payment_status: PaymentStatus,
    pub status_message: Option<String>,
    /// Written only when the order has no transaction id yet
    pub transaction_id: Option<String>,
    /// Written only when the order has no payment type yet
    pub payment_type: Option<String>,
    /// Written only when positive and different from the stored amount
    pub gross_amount: Option<Decimal>,
    pub raw_body: Vec<u8>,
}

/// Fields a provider callback may change on an order.
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillmentCallbackUpdate {
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub status_message: Option<String>,
    pub serial_number: Option<String>,
    /// Provider-side transaction id (`trx_id`)
    pub provider_ref_id: Option<String>,
    pub raw_body: Vec<u8>,
}
