//! Shared application state handed to every HTTP handler.

use std::sync::Arc;

use crate::jobs::queue::TaskQueue;
use crate::realtime::NotifierHandle;
use crate::services::order_store::OrderStore;

/// Secrets used to authenticate inbound webhooks.
#[derive(Clone)]
pub struct WebhookSecrets {
    pub payment_server_key: String,
    pub provider_webhook_secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub notifier: NotifierHandle,
    pub secrets: WebhookSecrets,
}
