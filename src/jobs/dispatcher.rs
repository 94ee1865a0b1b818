//! Worker pool that feeds queued topup tasks to the orchestrator.
//!
//! Each worker loops: dequeue → run the orchestrator (which bounds its own
//! run with the task timeout) → settle the task. A separate scheduler loop
//! promotes delayed and timed-out tasks once per second.
//!
//! # Settling
//!
//! | Orchestrator result | Queue action |
//! |---|---|
//! | `Skipped`, `Completed` | ack |
//! | `Deferred { retry_at }` | re-enqueue at `retry_at`, attempt unchanged |
//! | `RetryScheduled`, error, timeout | re-enqueue after backoff, attempt + 1 |
//! | attempt cap reached | fail the order, ack |
//! | attempt cap reached, order could not be failed | re-enqueue shortly, attempt unchanged |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::backoff::{MAX_ATTEMPTS, retry_delay};
use super::queue::{TaskQueue, TopupTask};
use crate::error::AppError;
use crate::models::order::FulfillmentStatus;
use crate::services::orchestrator::{Orchestrator, SkipReason, TASK_TIMEOUT, TopupOutcome};

/// How long a delivered task stays invisible before redelivery.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(TASK_TIMEOUT.as_secs() + 60);

/// Minutes before retrying to fail an exhausted order that was busy.
const EXHAUSTED_RETRY_MINUTES: i64 = 1;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with a task after one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Ack,
    Reschedule {
        task: TopupTask,
        ready_at: DateTime<Utc>,
    },
    /// The task has used all its deliveries
    Exhausted,
}

/// Decide how to settle `task` given the orchestrator's result.
pub fn settle(
    task: &TopupTask,
    result: &Result<TopupOutcome, AppError>,
    now: DateTime<Utc>,
) -> Settlement {
    let not_before = match result {
        Ok(TopupOutcome::Skipped(_)) | Ok(TopupOutcome::Completed(_)) => {
            return Settlement::Ack;
        }
        Ok(TopupOutcome::Deferred { retry_at }) => {
            return Settlement::Reschedule {
                task: task.clone(),
                ready_at: *retry_at,
            };
        }
        Ok(TopupOutcome::RetryScheduled { retry_at, .. }) => Some(*retry_at),
        Err(_) => None,
    };

    let next = task.next_attempt();
    if next.attempt >= MAX_ATTEMPTS {
        return Settlement::Exhausted;
    }

    let backoff = chrono::Duration::from_std(retry_delay(next.attempt))
        .unwrap_or_else(|_| chrono::Duration::minutes(15));
    let ready_at = match not_before {
        Some(retry_at) => (now + backoff).max(retry_at),
        None => now + backoff,
    };

    Settlement::Reschedule {
        task: next,
        ready_at,
    }
}

pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, orchestrator: Arc<Orchestrator>, concurrency: usize) -> Self {
        Self {
            queue,
            orchestrator,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn the workers and the scheduler. Handles run until the runtime stops.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let dispatcher = Arc::new(self);
        let mut handles = Vec::with_capacity(dispatcher.concurrency + 1);

        for worker_id in 0..dispatcher.concurrency {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.run_worker(worker_id).await;
            }));
        }

        let queue = dispatcher.queue.clone();
        handles.push(tokio::spawn(async move {
            run_scheduler(queue).await;
        }));

        tracing::info!(workers = dispatcher.concurrency, "Topup dispatcher started");

        handles
    }

    async fn run_worker(&self, worker_id: usize) {
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Topup worker error");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Deliver at most one task. Returns whether a task was taken.
    pub async fn run_once(&self) -> Result<bool, AppError> {
        let Some(task) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        tracing::info!(order_id = %task.order_id, task_id = %task.id, attempt = task.attempt, "Processing topup task");

        let result = self.orchestrator.process(&task.order_id).await;

        match &result {
            Err(e) => {
                tracing::warn!(order_id = %task.order_id, attempt = task.attempt, error = %e, "Topup task failed");
            }
            Ok(outcome) => {
                tracing::debug!(order_id = %task.order_id, ?outcome, "Topup task finished");
            }
        }

        match settle(&task, &result, Utc::now()) {
            Settlement::Ack => {}
            Settlement::Reschedule { task: next, ready_at } => {
                self.queue.enqueue_at(next, ready_at).await?;
            }
            Settlement::Exhausted => {
                tracing::error!(order_id = %task.order_id, "Topup task exhausted its attempts");
                let finished = match self.orchestrator.fail_exhausted(&task.order_id).await {
                    Ok(TopupOutcome::Completed(FulfillmentStatus::Failed))
                    | Ok(TopupOutcome::Completed(FulfillmentStatus::Sukses))
                    | Ok(TopupOutcome::Skipped(SkipReason::AlreadyTerminal))
                    | Ok(TopupOutcome::Skipped(SkipReason::OrderNotFound)) => true,
                    Ok(outcome) => {
                        tracing::warn!(order_id = %task.order_id, ?outcome, "Exhausted order not finalized");
                        false
                    }
                    Err(e) => {
                        tracing::error!(order_id = %task.order_id, error = %e, "Failed to finalize exhausted order");
                        false
                    }
                };
                if !finished {
                    self.queue
                        .enqueue_at(task.clone(), Utc::now() + chrono::Duration::minutes(EXHAUSTED_RETRY_MINUTES))
                        .await?;
                }
            }
        }

        self.queue.ack(&task).await?;

        Ok(true)
    }
}

async fn run_scheduler(queue: Arc<dyn TaskQueue>) {
    let mut ticker = tokio::time::interval(SCHEDULER_INTERVAL);
    loop {
        ticker.tick().await;
        match queue.promote_due(Utc::now()).await {
            Ok(0) => {}
            Ok(moved) => tracing::debug!(moved, "Promoted due topup tasks"),
            Err(e) => tracing::error!(error = %e, "Topup scheduler error"),
        }
    }
}
