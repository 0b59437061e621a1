//! Bounded retry loop for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use converge_core::{Error, Result};
use metrics::counter;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one get-merge-update attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Stale version token; the attempt may be repeated.
    Conflict(Error),
    Fatal(Error),
}

impl<T> From<Result<T>> for Attempt<T> {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(v) => Attempt::Done(v),
            Err(e @ Error::Conflict(_)) => Attempt::Conflict(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Capped exponential backoff with proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Up to this fraction of each delay is added at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(20),
            factor: 3.0,
            max: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Defaults overridden by `CONVERGE_RETRY_ATTEMPTS` and
    /// `CONVERGE_RETRY_INITIAL_MS`.
    pub fn from_env() -> Self {
        let mut p = Self::default();
        if let Some(n) = std::env::var("CONVERGE_RETRY_ATTEMPTS").ok().and_then(|s| s.parse::<u32>().ok()) {
            p.attempts = n.max(1);
        }
        if let Some(ms) = std::env::var("CONVERGE_RETRY_INITIAL_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            p.initial = Duration::from_millis(ms);
        }
        p
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let scaled = self.initial.as_nanos() as f64 * self.factor.max(1.0).powi(retry as i32);
        let capped = scaled.round().min(self.max.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let base = self.delay(retry);
        // NaN and infinity disable jitter.
        if !(self.jitter > 0.0 && self.jitter.is_finite()) {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }
}

/// Run `attempt` until it is done, fails fatally or the policy runs out.
///
/// Exhaustion returns the last conflict as-is. Cancellation interrupts both
/// attempts and backoff sleeps.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, cancel: &CancellationToken, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut n = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            o = attempt() => o,
        };
        n += 1;
        let conflict = match outcome {
            Attempt::Done(v) => return Ok(v),
            Attempt::Fatal(e) => return Err(e),
            Attempt::Conflict(e) => e,
        };
        if n >= attempts {
            debug!(attempts = n, "conflict retries exhausted");
            return Err(conflict);
        }
        counter!("merge_conflict_retries_total", 1u64);
        let wait = policy.jittered(n - 1);
        debug!(attempt = n, wait_ms = wait.as_millis() as u64, error = %conflict, "update conflict; retrying");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
