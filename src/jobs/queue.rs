//! Durable topup task queue.
//!
//! # Redis Layout
//!
//! - `topup:lane:{critical,default,low}`: ready tasks, one list per priority
//! - `topup:delayed`: sorted set of tasks scored by ready time (ms)
//! - `topup:inflight`: sorted set of delivered, unacknowledged tasks scored by
//!   visibility deadline (ms)
//!
//! Every move between these keys is a Lua script, so a task is never in two
//! places or lost between them. A task whose visibility deadline passes
//! without an `ack` goes back to its lane, which makes delivery at-least-once.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

const LANE_PREFIX: &str = "topup:lane:";
const DELAYED_KEY: &str = "topup:delayed";
const INFLIGHT_KEY: &str = "topup:inflight";

/// Tasks moved per scheduler pass, per sorted set.
const PROMOTE_BATCH: usize = 100;

/// Pop from the first non-empty lane and park the task in the in-flight set.
///
/// KEYS: lanes in priority order, then the in-flight set.
/// ARGV[1]: visibility deadline (ms).
const DEQUEUE_SCRIPT: &str = r#"
local inflight = KEYS[#KEYS]
for i = 1, #KEYS - 1 do
    local task = redis.call("RPOP", KEYS[i])
    if task then
        redis.call("ZADD", inflight, ARGV[1], task)
        return task
    end
end
return false
"#;

/// Move due members of a sorted set back onto their priority lane.
///
/// KEYS[1]: sorted set. ARGV[1]: now (ms), ARGV[2]: lane prefix, ARGV[3]: batch.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
for _, task in ipairs(due) do
    redis.call("ZREM", KEYS[1], task)
    local ok, decoded = pcall(cjson.decode, task)
    local priority = "default"
    if ok and decoded["priority"] then
        priority = decoded["priority"]
    end
    redis.call("LPUSH", ARGV[2] .. priority, task)
end
return #due
"#;

/// Queue lane. Lanes are drained strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Default,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Default, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Default => "default",
            Priority::Low => "low",
        }
    }

    fn lane_key(&self) -> String {
        format!("{}{}", LANE_PREFIX, self.as_str())
    }
}

/// One request to run the orchestrator for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupTask {
    pub id: Uuid,
    pub order_id: String,
    /// Failed deliveries so far
    pub attempt: u32,
    pub priority: Priority,
}

impl TopupTask {
    pub fn new(order_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.into(),
            attempt: 0,
            priority,
        }
    }

    /// The same task after one more failed delivery.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make the task ready on its lane now.
    async fn enqueue(&self, task: TopupTask) -> Result<(), AppError>;

    /// Hold the task until `ready_at`.
    async fn enqueue_at(&self, task: TopupTask, ready_at: DateTime<Utc>) -> Result<(), AppError>;

    /// Take the highest-priority ready task, if any. The task stays invisible
    /// to other consumers until acknowledged or until its visibility timeout.
    async fn dequeue(&self) -> Result<Option<TopupTask>, AppError>;

    /// Mark a delivered task done.
    async fn ack(&self, task: &TopupTask) -> Result<(), AppError>;

    /// Return due delayed tasks and timed-out in-flight tasks to their lanes.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, AppError>;
}

/// Enqueue a fresh task for `order_id`.
pub async fn enqueue_topup(
    queue: &dyn TaskQueue,
    order_id: &str,
    priority: Priority,
) -> Result<TopupTask, AppError> {
    let task = TopupTask::new(order_id, priority);
    queue.enqueue(task.clone()).await?;
    tracing::info!(order_id, task_id = %task.id, priority = priority.as_str(), "Topup task enqueued");
    Ok(task)
}

/// Redis-backed `TaskQueue`.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    visibility_timeout: Duration,
}

impl RedisTaskQueue {
    pub fn new(conn: ConnectionManager, visibility_timeout: Duration) -> Self {
        Self {
            conn,
            visibility_timeout,
        }
    }
}

fn encode(task: &TopupTask) -> Result<String, AppError> {
    serde_json::to_string(task).map_err(|e| AppError::Task(format!("failed to encode task: {}", e)))
}

fn decode(payload: &str) -> Result<TopupTask, AppError> {
    serde_json::from_str(payload).map_err(|e| AppError::Task(format!("failed to decode task: {}", e)))
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: TopupTask) -> Result<(), AppError> {
        let payload = encode(&task)?;
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("LPUSH")
            .arg(task.priority.lane_key())
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn enqueue_at(&self, task: TopupTask, ready_at: DateTime<Utc>) -> Result<(), AppError> {
        let payload = encode(&task)?;
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(ready_at.timestamp_millis())
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        tracing::debug!(order_id = %task.order_id, attempt = task.attempt, %ready_at, "Topup task delayed");

        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<TopupTask>, AppError> {
        let deadline = Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
        let mut conn = self.conn.clone();

        let dequeue = redis::Script::new(DEQUEUE_SCRIPT);
        let mut script = dequeue.prepare_invoke();
        for priority in Priority::ALL {
            script.key(priority.lane_key());
        }
        script.key(INFLIGHT_KEY).arg(deadline);

        let payload: Option<String> = script.invoke_async(&mut conn).await?;

        match payload {
            Some(payload) => match decode(&payload) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    // Unreadable payloads would otherwise be redelivered forever
                    tracing::error!(%payload, error = %e, "Dropping malformed task");
                    let _: () = redis::cmd("ZREM")
                        .arg(INFLIGHT_KEY)
                        .arg(&payload)
                        .query_async(&mut conn)
                        .await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn ack(&self, task: &TopupTask) -> Result<(), AppError> {
        let payload = encode(task)?;
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("ZREM")
            .arg(INFLIGHT_KEY)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn.clone();
        let script = redis::Script::new(PROMOTE_SCRIPT);

        let mut moved = 0usize;
        for key in [DELAYED_KEY, INFLIGHT_KEY] {
            let count: usize = script
                .key(key)
                .arg(now_ms)
                .arg(LANE_PREFIX)
                .arg(PROMOTE_BATCH)
                .invoke_async(&mut conn)
                .await?;
            if key == INFLIGHT_KEY && count > 0 {
                tracing::warn!(count, "Redelivering tasks past their visibility timeout");
            }
            moved += count;
        }

        Ok(moved)
    }
}
