//! In-memory stand-ins for the storage, lease, queue and provider seams.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use rust_decimal::Decimal;

use topup_fulfillment::error::AppError;
use topup_fulfillment::jobs::queue::{Priority, TaskQueue, TopupTask};
use topup_fulfillment::models::order::{FulfillmentStatus, Order, OrderUpdate, PaymentStatus};
use topup_fulfillment::models::product::Product;
use topup_fulfillment::models::webhook::{FulfillmentCallbackUpdate, PaymentUpdate, WebhookSource};
use topup_fulfillment::realtime::NotifierHandle;
use topup_fulfillment::services::fulfillment_client::{FulfillmentClient, ProviderExchange};
use topup_fulfillment::services::lease::{Lease, LeaseLock};
use topup_fulfillment::services::orchestrator::Orchestrator;
use topup_fulfillment::services::order_store::{DebitOutcome, OrderStore, RefundOutcome};
use topup_fulfillment::state::{AppState, WebhookSecrets};

pub const SERVER_KEY: &str = "SECRET";
pub const WEBHOOK_SECRET: &str = "hook-secret";

pub fn order(order_id: &str, purchase_price: Decimal) -> Order {
    let now = Utc::now();
    Order {
        id: 1,
        order_id: order_id.to_string(),
        product_id: Some(1),
        buyer_sku_code: "tsel10".to_string(),
        customer_no: "081234567890".to_string(),
        transaction_id: None,
        gross_amount: Decimal::new(10_000, 0),
        selling_price: Decimal::new(10_000, 0),
        purchase_price,
        payment_type: None,
        payment_status: PaymentStatus::Settlement,
        fulfillment_status: None,
        status_message: None,
        serial_number: None,
        provider_ref_id: None,
        retry_count: 0,
        last_error_code: None,
        saldo_debited_at: None,
        refunded_at: None,
        sent_at: None,
        retry_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn product(category: &str, start: NaiveTime, end: NaiveTime) -> Product {
    Product {
        id: 1,
        product_name: "Telkomsel 10K".to_string(),
        category: category.to_string(),
        buyer_sku_code: "tsel10".to_string(),
        unlimited_stock: true,
        stock: "0".to_string(),
        start_cut_off: start,
        end_cut_off: end,
    }
}

pub fn no_cutoff(category: &str) -> Product {
    product(category, NaiveTime::MIN, hms(23, 59, 59))
}

pub fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, s).unwrap()
}

pub fn utc(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn jakarta() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).unwrap()
}

#[derive(Default)]
pub struct MemoryStore {
    pub orders: Mutex<HashMap<String, Order>>,
    pub products: Mutex<Vec<Product>>,
    /// `None` means the application profile row is missing
    pub balance: Mutex<Option<Decimal>>,
    pub debits: AtomicUsize,
    pub refunds: AtomicUsize,
    /// Every call that would write to the database
    pub writes: AtomicUsize,
    pub exchanges: Mutex<Vec<(String, Vec<u8>, Vec<u8>)>>,
    pub webhook_events: Mutex<Vec<(WebhookSource, Option<String>, String)>>,
}

impl MemoryStore {
    pub fn with_balance(balance: Decimal) -> Arc<Self> {
        let store = Self::default();
        *store.balance.lock().unwrap() = Some(balance);
        Arc::new(store)
    }

    pub fn insert_order(&self, order: Order) {
        self.orders
            .lock()
            .unwrap()
            .insert(order.order_id.clone(), order);
    }

    pub fn insert_product(&self, product: Product) {
        self.products.lock().unwrap().push(product);
    }

    pub fn get(&self, order_id: &str) -> Order {
        self.orders.lock().unwrap()[order_id].clone()
    }

    pub fn balance(&self) -> Option<Decimal> {
        *self.balance.lock().unwrap()
    }

    pub fn debit_count(&self) -> usize {
        self.debits.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn event_outcomes(&self) -> Vec<String> {
        self.webhook_events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, outcome)| outcome.clone())
            .collect()
    }

    /// Another worker debits (if needed) and completes the order.
    pub fn complete_elsewhere(&self, order_id: &str) {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).unwrap();
        if order.saldo_debited_at.is_none() {
            let mut balance = self.balance.lock().unwrap();
            *balance = balance.map(|b| b - order.purchase_price);
            order.saldo_debited_at = Some(Utc::now());
            self.debits.fetch_add(1, Ordering::SeqCst);
        }
        order.fulfillment_status = Some(FulfillmentStatus::Sukses);
        order.serial_number = Some("SN-OTHER".to_string());
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn with_order<T>(
        &self,
        order_id: &str,
        f: impl FnOnce(&mut Order) -> T,
    ) -> Result<T, AppError> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).ok_or(AppError::OrderNotFound)?;
        let result = f(order);
        order.updated_at = Utc::now();
        Ok(result)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        Ok(self.orders.lock().unwrap().get(order_id).cloned())
    }

    async fn lock_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        self.find_order(order_id).await
    }

    async fn find_product(&self, order: &Order) -> Result<Option<Product>, AppError> {
        Ok(self
            .products
            .lock()
            .unwrap()
            .iter()
            .find(|p| Some(p.id) == order.product_id || p.buyer_sku_code == order.buyer_sku_code)
            .cloned())
    }

    async fn update_order(&self, order_id: &str, update: &OrderUpdate) -> Result<(), AppError> {
        self.write();
        self.with_order(order_id, |order| {
            if update.fulfillment_status.is_some() {
                order.fulfillment_status = update.fulfillment_status;
            }
            if let Some(message) = &update.status_message {
                order.status_message = Some(message.clone());
            }
            if let Some(code) = &update.last_error_code {
                order.last_error_code = Some(code.clone());
            }
            if let Some(sn) = &update.serial_number {
                order.serial_number = Some(sn.clone());
            }
            if let Some(ref_id) = &update.provider_ref_id {
                order.provider_ref_id = Some(ref_id.clone());
            }
            if update.sent_at.is_some() {
                order.sent_at = update.sent_at;
            }
            if update.retry_at.is_some() {
                order.retry_at = update.retry_at;
            }
        })
    }

    async fn mark_failed(
        &self,
        order_id: &str,
        message: &str,
        code: Option<&str>,
    ) -> Result<bool, AppError> {
        self.write();
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(false);
        };
        if order.fulfillment_status == Some(FulfillmentStatus::Sukses) {
            return Ok(false);
        }
        order.fulfillment_status = Some(FulfillmentStatus::Failed);
        order.status_message = Some(message.to_string());
        if let Some(code) = code {
            order.last_error_code = Some(code.to_string());
        }
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_retry(&self, order_id: &str) -> Result<i32, AppError> {
        self.write();
        self.with_order(order_id, |order| {
            order.retry_count += 1;
            order.retry_count
        })
    }

    async fn debit_order(&self, order_id: &str) -> Result<DebitOutcome, AppError> {
        self.write();
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).ok_or(AppError::OrderNotFound)?;
        if order.saldo_debited_at.is_some() {
            return Ok(DebitOutcome::AlreadyDebited);
        }

        let mut balance = self.balance.lock().unwrap();
        let Some(current) = *balance else {
            return Ok(DebitOutcome::ProfileNotFound);
        };
        if current < order.purchase_price {
            return Ok(DebitOutcome::InsufficientFunds);
        }

        let remaining = current - order.purchase_price;
        *balance = Some(remaining);
        order.saldo_debited_at = Some(Utc::now());
        order.fulfillment_status = Some(FulfillmentStatus::Processing);
        self.debits.fetch_add(1, Ordering::SeqCst);

        Ok(DebitOutcome::Debited { remaining })
    }

    async fn refund_order(&self, order_id: &str) -> Result<RefundOutcome, AppError> {
        self.write();
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).ok_or(AppError::OrderNotFound)?;
        if order.fulfillment_status == Some(FulfillmentStatus::Sukses) {
            return Ok(RefundOutcome::Fulfilled);
        }
        if order.saldo_debited_at.is_none() {
            return Ok(RefundOutcome::NotDebited);
        }
        if order.refunded_at.is_some() {
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let mut balance = self.balance.lock().unwrap();
        let Some(current) = *balance else {
            return Ok(RefundOutcome::ProfileNotFound);
        };

        *balance = Some(current + order.purchase_price);
        order.refunded_at = Some(Utc::now());
        self.refunds.fetch_add(1, Ordering::SeqCst);

        Ok(RefundOutcome::Refunded {
            amount: order.purchase_price,
        })
    }

    async fn record_provider_exchange(
        &self,
        order_id: &str,
        request: &[u8],
        response: &[u8],
    ) -> Result<(), AppError> {
        self.write();
        self.exchanges.lock().unwrap().push((
            order_id.to_string(),
            request.to_vec(),
            response.to_vec(),
        ));
        Ok(())
    }

    async fn apply_payment_update(
        &self,
        order_id: &str,
        update: &PaymentUpdate,
    ) -> Result<Order, AppError> {
        self.write();
        self.with_order(order_id, |order| {
            order.payment_status = update.payment_status;
            if let Some(message) = &update.status_message {
                order.status_message = Some(message.clone());
            }
            if order.transaction_id.is_none() {
                order.transaction_id = update.transaction_id.clone();
            }
            if order.payment_type.is_none() {
                order.payment_type = update.payment_type.clone();
            }
            if let Some(amount) = update.gross_amount {
                order.gross_amount = amount;
            }
            order.clone()
        })
    }

    async fn apply_fulfillment_callback(
        &self,
        order_id: &str,
        update: &FulfillmentCallbackUpdate,
    ) -> Result<Order, AppError> {
        self.write();
        self.with_order(order_id, |order| {
            if update.fulfillment_status.is_some() {
                order.fulfillment_status = update.fulfillment_status;
            }
            if let Some(status) = update.payment_status {
                order.payment_status = status;
            }
            if let Some(message) = &update.status_message {
                order.status_message = Some(message.clone());
            }
            if let Some(sn) = &update.serial_number {
                order.serial_number = Some(sn.clone());
            }
            if let Some(ref_id) = &update.provider_ref_id {
                order.provider_ref_id = Some(ref_id.clone());
            }
            order.clone()
        })
    }

    async fn record_webhook_event(
        &self,
        source: WebhookSource,
        order_id: Option<&str>,
        _payload: &[u8],
        outcome: &str,
    ) -> Result<(), AppError> {
        self.write();
        self.webhook_events.lock().unwrap().push((
            source,
            order_id.map(str::to_string),
            outcome.to_string(),
        ));
        Ok(())
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Lease lock over a map; `hold` simulates another worker owning a key.
#[derive(Default)]
pub struct MemoryLease {
    held: Mutex<HashMap<String, String>>,
    on_acquire: Mutex<Option<Hook>>,
}

impl MemoryLease {
    pub fn hold(&self, key: &str) {
        self.held
            .lock()
            .unwrap()
            .insert(key.to_string(), "other-worker".to_string());
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().unwrap().contains_key(key)
    }

    /// Run `hook` once, just before the next acquire takes the key.
    pub fn on_acquire(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_acquire.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl LeaseLock for MemoryLease {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<Lease, AppError> {
        let hook = self.on_acquire.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let mut held = self.held.lock().unwrap();
        if held.contains_key(key) {
            return Err(AppError::LeaseHeld(key.to_string()));
        }
        let token = uuid::Uuid::new_v4().to_string();
        held.insert(key.to_string(), token.clone());
        Ok(Lease {
            key: key.to_string(),
            token,
        })
    }

    async fn release(&self, lease: &Lease) -> Result<(), AppError> {
        let mut held = self.held.lock().unwrap();
        if held.get(&lease.key) == Some(&lease.token) {
            held.remove(&lease.key);
        }
        Ok(())
    }
}

/// Provider client that plays back queued replies in order.
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<ProviderExchange, AppError>>>,
    pub timeouts: Mutex<Vec<Duration>>,
    on_send: Mutex<Option<Hook>>,
    stall: Mutex<Option<Duration>>,
}

impl ScriptedClient {
    pub fn reply(&self, rc: &str, message: &str, sn: &str) {
        let body = serde_json::json!({
            "data": { "rc": rc, "message": message, "sn": sn, "ref_id": "PRV-1" }
        });
        self.replies.lock().unwrap().push_back(Ok(ProviderExchange {
            request: b"{\"ref_id\":\"ORD-1\"}".to_vec(),
            response: serde_json::to_vec(&body).unwrap(),
        }));
    }

    pub fn fail_with(&self, error: AppError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.timeouts.lock().unwrap().len()
    }

    /// Run `hook` once while the next request is in flight.
    pub fn on_send(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    /// Make every request hang for `delay` before replying.
    pub fn stall(&self, delay: Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl FulfillmentClient for ScriptedClient {
    async fn send(&self, _order: &Order, timeout: Duration) -> Result<ProviderExchange, AppError> {
        self.timeouts.lock().unwrap().push(timeout);
        let hook = self.on_send.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let stall = *self.stall.lock().unwrap();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::ProviderResponse("no scripted reply".to_string())))
    }
}

/// Queue kept in memory; delayed tasks are only listed, never promoted.
#[derive(Default)]
pub struct MemoryQueue {
    pub ready: Mutex<Vec<TopupTask>>,
    pub delayed: Mutex<Vec<(DateTime<Utc>, TopupTask)>>,
    pub inflight: Mutex<Vec<TopupTask>>,
}

impl MemoryQueue {
    pub fn ready_tasks(&self) -> Vec<TopupTask> {
        self.ready.lock().unwrap().clone()
    }

    pub fn delayed_tasks(&self) -> Vec<(DateTime<Utc>, TopupTask)> {
        self.delayed.lock().unwrap().clone()
    }

    pub fn inflight_tasks(&self) -> Vec<TopupTask> {
        self.inflight.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: TopupTask) -> Result<(), AppError> {
        self.ready.lock().unwrap().push(task);
        Ok(())
    }

    async fn enqueue_at(&self, task: TopupTask, ready_at: DateTime<Utc>) -> Result<(), AppError> {
        self.delayed.lock().unwrap().push((ready_at, task));
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<TopupTask>, AppError> {
        let mut ready = self.ready.lock().unwrap();
        let next = Priority::ALL.iter().find_map(|priority| {
            ready.iter().position(|task| task.priority == *priority)
        });
        let Some(index) = next else {
            return Ok(None);
        };
        let task = ready.remove(index);
        self.inflight.lock().unwrap().push(task.clone());
        Ok(Some(task))
    }

    async fn ack(&self, task: &TopupTask) -> Result<(), AppError> {
        self.inflight.lock().unwrap().retain(|t| t != task);
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let mut delayed = self.delayed.lock().unwrap();
        let (due, waiting): (Vec<_>, Vec<_>) = delayed.drain(..).partition(|(at, _)| *at <= now);
        *delayed = waiting;
        let count = due.len();
        self.ready
            .lock()
            .unwrap()
            .extend(due.into_iter().map(|(_, task)| task));
        Ok(count)
    }
}

/// Everything needed to drive the orchestrator against in-memory fakes.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub lease: Arc<MemoryLease>,
    pub client: Arc<ScriptedClient>,
    pub queue: Arc<MemoryQueue>,
    pub notifier: NotifierHandle,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(balance: Option<Decimal>) -> Self {
        Self::build(balance, None)
    }

    /// Like `new`, with a shorter bound on one orchestrator run.
    pub fn with_task_timeout(balance: Option<Decimal>, task_timeout: Duration) -> Self {
        Self::build(balance, Some(task_timeout))
    }

    fn build(balance: Option<Decimal>, task_timeout: Option<Duration>) -> Self {
        let store = Arc::new(MemoryStore::default());
        *store.balance.lock().unwrap() = balance;

        let lease = Arc::new(MemoryLease::default());
        let client = Arc::new(ScriptedClient::default());
        let queue = Arc::new(MemoryQueue::default());
        let notifier = NotifierHandle::spawn(store.clone());

        let mut orchestrator = Orchestrator::new(
            store.clone(),
            lease.clone(),
            client.clone(),
            notifier.clone(),
            jakarta(),
        );
        if let Some(task_timeout) = task_timeout {
            orchestrator = orchestrator.with_task_timeout(task_timeout);
        }
        let orchestrator = Arc::new(orchestrator);

        Self {
            store,
            lease,
            client,
            queue,
            notifier,
            orchestrator,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            queue: self.queue.clone(),
            notifier: self.notifier.clone(),
            secrets: WebhookSecrets {
                payment_server_key: SERVER_KEY.to_string(),
                provider_webhook_secret: WEBHOOK_SECRET.to_string(),
            },
        }
    }
}
