//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use chrono::FixedOffset;
use serde::Deserialize;

use crate::error::AppError;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `REDIS_URL` (required): Redis connection string for the task queue and lease locks
/// - `PROVIDER_USERNAME`, `PROVIDER_PROD_KEY` (required): fulfillment provider credentials
/// - `PAYMENT_SERVER_KEY` (required): payment gateway server key used to verify settlement notices
/// - `PROVIDER_WEBHOOK_SECRET` (required): shared secret for fulfillment callbacks
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    pub redis_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub provider_username: String,

    pub provider_prod_key: String,

    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    pub payment_server_key: String,

    pub provider_webhook_secret: String,

    /// Number of concurrent queue consumers.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Offset of the provider's local time zone; product cutoff windows are
    /// expressed in this zone.
    #[serde(default = "default_cutoff_utc_offset_hours")]
    pub cutoff_utc_offset_hours: i32,

    #[serde(default = "default_cors_allowed_origin")]
    pub cors_allowed_origin: String,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_max_connections() -> u32 {
    10
}

fn default_provider_base_url() -> String {
    "https://api.digiflazz.com".to_string()
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_cutoff_utc_offset_hours() -> i32 {
    7
}

fn default_cors_allowed_origin() -> String {
    "http://localhost:3000".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL)
    /// - Environment variable values cannot be parsed into expected types
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    /// Provider transaction endpoint, `{base}/v1/transaction`.
    pub fn provider_transaction_url(&self) -> Result<url::Url, AppError> {
        let base = url::Url::parse(&self.provider_base_url).map_err(|e| {
            AppError::InvalidRequest(format!("invalid PROVIDER_BASE_URL: {}", e))
        })?;

        base.join("/v1/transaction")
            .map_err(|e| AppError::InvalidRequest(format!("invalid provider endpoint: {}", e)))
    }

    pub fn cutoff_offset(&self) -> Result<FixedOffset, AppError> {
        FixedOffset::east_opt(self.cutoff_utc_offset_hours * 3600).ok_or_else(|| {
            AppError::InvalidRequest(format!(
                "CUTOFF_UTC_OFFSET_HOURS out of range: {}",
                self.cutoff_utc_offset_hours
            ))
        })
    }
}
