//! Short-lived per-order mutual exclusion.
//!
//! A lease is a Redis key set with `SET key token NX PX ttl`, so acquisition is
//! a single atomic set-if-absent. Release deletes the key only while it still
//! holds our token, which makes it idempotent and harmless after expiry.
//!
//! The lease avoids duplicate provider calls; the order row lock and the
//! debit/refund markers remain the correctness guarantee.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::AppError;

/// How long a worker may hold an order before the lease self-expires.
pub const LEASE_TTL: Duration = Duration::from_secs(300);

/// Compare-and-delete: only the holder's token may remove the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// A held lease. Dropping it does not release it; call `LeaseLock::release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

/// Lease key for an order's external identifier.
pub fn lease_key(order_id: &str) -> String {
    format!("topup_lease:{}", order_id)
}

#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Take the lease or fail immediately with `AppError::LeaseHeld`.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease, AppError>;

    /// Give the lease back. Releasing an expired or foreign lease is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), AppError>;
}

/// Redis-backed lease lock.
#[derive(Clone)]
pub struct RedisLeaseLock {
    conn: ConnectionManager,
}

impl RedisLeaseLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LeaseLock for RedisLeaseLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease, AppError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        match reply {
            Some(_) => Ok(Lease {
                key: key.to_string(),
                token,
            }),
            None => Err(AppError::LeaseHeld(key.to_string())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), AppError> {
        let mut conn = self.conn.clone();

        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            tracing::debug!(key = %lease.key, "Lease already expired or taken over");
        }

        Ok(())
    }
}
