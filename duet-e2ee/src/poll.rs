//! Bounded polling with an injectable sleep.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use duet_core::error::{DuetError, DuetResult};

/// Suspends the current task between polls.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fixed attempts, fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on the time spent sleeping.
    pub fn max_wait(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Run `check` until it yields a value or the attempts run out.
///
/// The sleeper is invoked after every miss, including the last one, so an
/// exhausted poll has slept exactly `max_attempts × interval`. Errors from
/// `check` end the poll immediately.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    sleeper: &dyn Sleeper,
    what: &str,
    mut check: F,
) -> DuetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DuetResult<Option<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = check().await? {
            debug!("{} available after {} attempt(s)", what, attempt);
            return Ok(value);
        }
        debug!("{} not available (attempt {}/{})", what, attempt, policy.max_attempts);
        sleeper.sleep(policy.interval).await;
    }
    Err(DuetError::PartnerNotReady(what.to_string()))
}
