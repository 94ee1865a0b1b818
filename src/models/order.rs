//! Order data models.
//!
//! This module defines:
//! - `Order`: Database entity representing one top-up purchase
//! - `PaymentStatus` / `FulfillmentStatus`: the two lifecycles an order moves through
//! - `OrderSnapshot`: the client-facing view pushed over the realtime channel
//! - `OrderUpdate`: the whitelisted set of fields the fulfillment path may write

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::UnknownStatus;

/// Represents an order record from the database.
///
/// # Database Table
///
/// Maps to the `orders` table. Each order:
/// - Is identified externally by `order_id` (also the provider `ref_id`)
/// - Stores money as `NUMERIC` / `Decimal` (never floats)
/// - Carries `saldo_debited_at` and `refunded_at` markers that make the
///   ledger debit and the refund each happen at most once
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Order {
    pub id: i64,

    /// Stable external identifier, unique across all orders
    pub order_id: String,

    pub product_id: Option<i64>,

    /// Provider SKU code
    pub buyer_sku_code: String,

    /// Customer target number (phone, meter, account)
    pub customer_no: String,

    /// Payment gateway or provider transaction id
    pub transaction_id: Option<String>,

    pub gross_amount: Decimal,

    pub selling_price: Decimal,

    /// Wholesale cost debited from the application balance
    pub purchase_price: Decimal,

    pub payment_type: Option<String>,

    pub payment_status: PaymentStatus,

    /// `None` until the order enters fulfillment
    pub fulfillment_status: Option<FulfillmentStatus>,

    pub status_message: Option<String>,

    pub serial_number: Option<String>,

    pub provider_ref_id: Option<String>,

    pub retry_count: i32,

    pub last_error_code: Option<String>,

    /// Set exactly once, in the same transaction as the balance debit
    pub saldo_debited_at: Option<DateTime<Utc>>,

    /// Set exactly once, in the same transaction as the balance credit
    pub refunded_at: Option<DateTime<Utc>>,

    /// When the provider call was last issued
    pub sent_at: Option<DateTime<Utc>>,

    /// Earliest next attempt
    pub retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Terminal orders are never processed again.
    pub fn is_terminal(&self) -> bool {
        self.fulfillment_status
            .is_some_and(|status| status.is_terminal())
    }

    pub fn is_debited(&self) -> bool {
        self.saldo_debited_at.is_some()
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            transaction_id: self.transaction_id.clone(),
            order_id: self.order_id.clone(),
            payment_status: self.payment_status,
            fulfillment_status: self.fulfillment_status,
            serial_number: self.serial_number.clone(),
            gross_amount: self.gross_amount,
            payment_type: self.payment_type.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Payment lifecycle as reported by the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Settlement,
    /// Set by a successful fulfillment callback
    Success,
    Failed,
    Refunded,
    PartialRefund,
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Settlement => "settlement",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartialRefund => "partial_refund",
            PaymentStatus::Unknown => "unknown",
        }
    }

    /// Map a gateway `transaction_status` onto the application's payment status.
    pub fn from_gateway(transaction_status: &str) -> Self {
        match transaction_status {
            "capture" | "settlement" => PaymentStatus::Settlement,
            "pending" => PaymentStatus::Pending,
            "deny" | "cancel" | "expire" | "failure" => PaymentStatus::Failed,
            "refund" => PaymentStatus::Refunded,
            "partial_refund" => PaymentStatus::PartialRefund,
            _ => PaymentStatus::Unknown,
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "settlement" => Ok(PaymentStatus::Settlement),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "partial_refund" => Ok(PaymentStatus::PartialRefund),
            "unknown" => Ok(PaymentStatus::Unknown),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

text_column!(PaymentStatus);

/// Fulfillment lifecycle driven by the orchestrator and provider callbacks.
///
/// `Sukses` keeps the provider's spelling because it is part of the
/// persisted and client-visible vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FulfillmentStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "Sukses")]
    Sukses,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Pending => "pending",
            FulfillmentStatus::Processing => "processing",
            FulfillmentStatus::Sukses => "Sukses",
            FulfillmentStatus::Failed => "failed",
            FulfillmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FulfillmentStatus::Sukses | FulfillmentStatus::Failed | FulfillmentStatus::Cancelled
        )
    }

    /// Map the `status` field of a provider callback.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "Sukses" => Some(FulfillmentStatus::Sukses),
            "Gagal" => Some(FulfillmentStatus::Failed),
            "Pending" => Some(FulfillmentStatus::Pending),
            _ => None,
        }
    }
}

impl FromStr for FulfillmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FulfillmentStatus::Pending),
            "processing" => Ok(FulfillmentStatus::Processing),
            "Sukses" => Ok(FulfillmentStatus::Sukses),
            "failed" => Ok(FulfillmentStatus::Failed),
            "cancelled" => Ok(FulfillmentStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

text_column!(FulfillmentStatus);

/// Client-facing view of an order.
///
/// # JSON Example
///
/// ```json
/// {
///   "transaction_id": "9aed5972-5b6a-401e-894b-a32c91ed1a3a",
///   "order_id": "ORD-20250101120000-1234",
///   "payment_status": "settlement",
///   "fulfillment_status": "Sukses",
///   "serial_number": "0412-3456-7890",
///   "gross_amount": "10000.00",
///   "payment_type": "qris",
///   "updated_at": "2025-01-01T12:00:05Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub transaction_id: Option<String>,
    pub order_id: String,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub serial_number: Option<String>,
    pub gross_amount: Decimal,
    pub payment_type: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Fields the fulfillment path may change on an order.
///
/// `None` leaves the column untouched; nothing outside this list is ever
/// written by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderUpdate {
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub status_message: Option<String>,
    pub last_error_code: Option<String>,
    pub serial_number: Option<String>,
    pub provider_ref_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
}

impl OrderUpdate {
    pub fn status(status: FulfillmentStatus, message: impl Into<String>) -> Self {
        Self {
            fulfillment_status: Some(status),
            status_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn error_code(mut self, code: impl Into<String>) -> Self {
        self.last_error_code = Some(code.into());
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at = Some(at);
        self
    }
}
