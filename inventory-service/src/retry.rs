//! Bounded retry for optimistic-lock conflicts.
//!
//! Every read-modify-write against the product counters goes through
//! [`retry_on_conflict`]. Only transient errors (a lost race on the
//! version token) are retried; the attempt count and an overall deadline
//! both bound the loop.

use rand::Rng;
use shared::InventoryResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock budget for all attempts together.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
            deadline: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the backoff window after `attempt` failed attempts:
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full jitter: a uniform pick from `[0, backoff_ceiling]`, so racing
    /// writers spread out instead of colliding again in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.backoff_ceiling(attempt).as_micros()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_micros(jitter)
    }
}

pub async fn retry_on_conflict<F, Fut, T>(policy: &RetryPolicy, operation: &str, mut attempt_once: F) -> InventoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = InventoryResult<T>>,
{
    let started = Instant::now();
    let mut attempt = 1;

    loop {
        match attempt_once().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", operation, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                if attempt >= policy.max_attempts {
                    warn!("{} gave up after {} attempts: {}", operation, attempt, err);
                    return Err(err);
                }

                let delay = policy.backoff(attempt);
                if started.elapsed() + delay > policy.deadline {
                    warn!("{} hit its {:?} deadline after {} attempts: {}", operation, policy.deadline, attempt, err);
                    return Err(err);
                }

                debug!("{} conflicted on attempt {}, retrying in {:?}", operation, attempt, delay);
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
