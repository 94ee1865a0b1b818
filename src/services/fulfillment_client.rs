//! Outbound calls to the fulfillment provider.
//!
//! # Request Signing
//!
//! Every transaction request carries `sign = hex(md5(username + prod_key + ref_id))`,
//! where `ref_id` is the order's external identifier.
//!
//! # Timeouts
//!
//! Bill-payment categories settle slowly upstream and get 60 seconds;
//! everything else gets 30 seconds.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::order::Order;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SLOW_CATEGORY_TIMEOUT: Duration = Duration::from_secs(60);

const SLOW_CATEGORIES: [&str; 4] = ["PLN", "BPJS", "TELKOM", "PASCABAYAR"];

/// Body of `POST {base}/v1/transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupRequest {
    pub username: String,
    pub buyer_sku_code: String,
    pub customer_no: String,
    pub ref_id: String,
    pub sign: String,
}

impl TopupRequest {
    pub fn for_order(username: &str, prod_key: &str, order: &Order) -> Self {
        Self {
            username: username.to_string(),
            buyer_sku_code: order.buyer_sku_code.clone(),
            customer_no: order.customer_no.clone(),
            ref_id: order.order_id.clone(),
            sign: sign(username, prod_key, &order.order_id),
        }
    }
}

/// `hex(md5(username + prod_key + ref_id))`
pub fn sign(username: &str, prod_key: &str, ref_id: &str) -> String {
    let digest = md5::compute(format!("{}{}{}", username, prod_key, ref_id));
    format!("{:x}", digest)
}

/// Provider timeout for a product category. Unknown products use the default.
pub fn timeout_for_category(category: Option<&str>) -> Duration {
    match category {
        Some(category) if SLOW_CATEGORIES.contains(&category) => SLOW_CATEGORY_TIMEOUT,
        _ => DEFAULT_TIMEOUT,
    }
}

/// Provider reply envelope, `{"data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderReply {
    pub data: ProviderReplyData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderReplyData {
    #[serde(default)]
    pub rc: String,
    #[serde(default)]
    pub message: String,
    /// Serial number / voucher code on success
    #[serde(default)]
    pub sn: String,
    #[serde(default)]
    pub ref_id: String,
}

/// Raw bytes of one provider round trip, kept verbatim for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderExchange {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

impl ProviderExchange {
    /// Decode the response body.
    ///
    /// # Errors
    ///
    /// `ProviderResponse` when the body is not the expected JSON envelope.
    pub fn parse(&self) -> Result<ProviderReplyData, AppError> {
        serde_json::from_slice::<ProviderReply>(&self.response)
            .map(|reply| reply.data)
            .map_err(|e| AppError::ProviderResponse(format!("unreadable provider reply: {}", e)))
    }
}

#[async_trait]
pub trait FulfillmentClient: Send + Sync {
    /// Send a signed transaction request for `order`, bounded by `timeout`.
    async fn send(&self, order: &Order, timeout: Duration) -> Result<ProviderExchange, AppError>;
}

/// `reqwest`-backed provider client.
#[derive(Clone)]
pub struct HttpFulfillmentClient {
    http: reqwest::Client,
    endpoint: url::Url,
    username: String,
    prod_key: String,
}

impl HttpFulfillmentClient {
    pub fn new(endpoint: url::Url, username: String, prod_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            username,
            prod_key,
        }
    }
}

#[async_trait]
impl FulfillmentClient for HttpFulfillmentClient {
    async fn send(&self, order: &Order, timeout: Duration) -> Result<ProviderExchange, AppError> {
        let request = TopupRequest::for_order(&self.username, &self.prod_key, order);
        let body = serde_json::to_vec(&request)
            .map_err(|e| AppError::ProviderResponse(format!("failed to encode request: {}", e)))?;

        tracing::info!(
            order_id = %order.order_id,
            sku = %order.buyer_sku_code,
            timeout_secs = timeout.as_secs(),
            "Sending transaction to provider"
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(body.clone())
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let response = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        Ok(ProviderExchange {
            request: body,
            response: response.to_vec(),
        })
    }
}

fn map_transport_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::ProviderTimeout(timeout.as_secs())
    } else {
        AppError::ProviderNetwork(e)
    }
}
