//! Redelivery backoff for failed topup tasks.

use std::time::Duration;

/// Deliveries of one task before the order is forced to terminal failure.
pub const MAX_ATTEMPTS: u32 = 5;

const SCHEDULE_MINUTES: [u64; 5] = [1, 3, 5, 10, 15];

/// Delay before redelivering a task that has failed `attempt` times.
///
/// 1, 3, 5, 10, 15 minutes, then 15 minutes for anything beyond.
pub fn retry_delay(attempt: u32) -> Duration {
    let index = (attempt.max(1) as usize - 1).min(SCHEDULE_MINUTES.len() - 1);
    Duration::from_secs(SCHEDULE_MINUTES[index] * 60)
}
