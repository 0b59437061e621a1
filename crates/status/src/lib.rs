//! Converge status: a background loop that asks the owning reconciler to
//! re-derive the status of workloads whose replica accounting or
//! availability looks stalled.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use converge_core::status::{StatusGetter, AVAILABLE};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Owner of a collection of status-bearing resources.
pub trait StatusReconciler: Send + Sync {
    type Resource: StatusGetter;

    /// Visit every resource currently known; order is up to the implementor.
    fn iterate(&self, visit: &mut dyn FnMut(&Self::Resource));

    /// Re-derive and write the status of `resource`. Expected to return
    /// quickly, e.g. by enqueueing work.
    fn refresh_status_for(&self, resource: &Self::Resource);
}

/// Replica counts disagree, or some `Available` condition is not True.
pub fn needs_refresh<S: StatusGetter + ?Sized>(resource: &S) -> bool {
    let expected = resource.expected_replicas();
    if expected != resource.updated_replicas() || expected != resource.available_replicas() {
        return true;
    }
    resource.conditions().iter().any(|c| c.type_ == AVAILABLE && !c.is_true())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPoller {
    period: Duration,
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl StatusPoller {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Period from `CONVERGE_STATUS_POLL_SECS`, falling back to one minute.
    pub fn from_env() -> Self {
        let secs = std::env::var("CONVERGE_STATUS_POLL_SECS").ok().and_then(|s| s.parse::<u64>().ok()).filter(|s| *s > 0);
        secs.map(|s| Self::new(Duration::from_secs(s))).unwrap_or_default()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One pass over the reconciler's resources. Returns how many were
    /// refreshed; each resource at most once.
    pub fn scan<R: StatusReconciler + ?Sized>(&self, reconciler: &R) -> usize {
        let mut refreshed = 0;
        reconciler.iterate(&mut |res| {
            if needs_refresh(res) {
                reconciler.refresh_status_for(res);
                refreshed += 1;
            }
        });
        refreshed
    }

    /// Scan once per period until `cancel` fires. The first scan happens one
    /// period after the call; a slow scan delays the following ticks.
    pub async fn run<R: StatusReconciler + ?Sized>(&self, reconciler: &R, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs_f64(), "status poller started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let n = self.scan(reconciler);
                    if n > 0 {
                        counter!("status_refresh_total", n as u64);
                        debug!(refreshed = n, "status refresh triggered");
                    }
                }
            }
        }
        info!("status poller stopped");
    }

    pub fn spawn<R>(self, reconciler: Arc<R>, cancel: CancellationToken) -> JoinHandle<()>
    where
        R: StatusReconciler + 'static,
    {
        tokio::spawn(async move { self.run(reconciler.as_ref(), cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::status::{Condition, ConditionStatus};

    struct Replicas(i32, i32, i32, Vec<Condition>);

    impl StatusGetter for Replicas {
        fn expected_replicas(&self) -> i32 {
            self.0
        }
        fn updated_replicas(&self) -> i32 {
            self.1
        }
        fn available_replicas(&self) -> i32 {
            self.2
        }
        fn conditions(&self) -> &[Condition] {
            &self.3
        }
    }

    fn available(status: ConditionStatus) -> Condition {
        Condition::new(AVAILABLE, status)
    }

    #[test]
    fn replica_mismatch_triggers() {
        assert!(needs_refresh(&Replicas(3, 3, 2, vec![])));
        assert!(needs_refresh(&Replicas(3, 2, 3, vec![])));
        assert!(!needs_refresh(&Replicas(3, 3, 3, vec![])));
    }

    #[test]
    fn any_unavailable_condition_triggers() {
        assert!(!needs_refresh(&Replicas(3, 3, 3, vec![available(ConditionStatus::True)])));
        assert!(needs_refresh(&Replicas(3, 3, 3, vec![available(ConditionStatus::Unknown)])));
        assert!(needs_refresh(&Replicas(3, 3, 3, vec![Condition::new("Reconciled", ConditionStatus::True), available(ConditionStatus::False)])));
        assert!(needs_refresh(&Replicas(3, 3, 3, vec![available(ConditionStatus::True), available(ConditionStatus::False)])));
    }

    #[test]
    fn default_period_is_one_minute() {
        assert_eq!(StatusPoller::default().period(), Duration::from_secs(60));
    }
}
