use std::sync::{Arc, Mutex};
use std::time::Duration;

use converge_core::status::{Condition, ConditionStatus, StatusGetter, AVAILABLE};
use converge_status::{StatusPoller, StatusReconciler};
use tokio_util::sync::CancellationToken;

struct Workload {
    name: &'static str,
    expected: i32,
    updated: i32,
    available: i32,
    conditions: Vec<Condition>,
}

impl StatusGetter for Workload {
    fn expected_replicas(&self) -> i32 {
        self.expected
    }
    fn updated_replicas(&self) -> i32 {
        self.updated
    }
    fn available_replicas(&self) -> i32 {
        self.available
    }
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

#[derive(Default)]
struct Recorder {
    workloads: Vec<Workload>,
    refreshed: Mutex<Vec<&'static str>>,
}

impl StatusReconciler for Recorder {
    type Resource = Workload;

    fn iterate(&self, visit: &mut dyn FnMut(&Workload)) {
        self.workloads.iter().for_each(visit);
    }

    fn refresh_status_for(&self, w: &Workload) {
        self.refreshed.lock().unwrap().push(w.name);
    }
}

impl Recorder {
    fn refreshed(&self) -> Vec<&'static str> {
        self.refreshed.lock().unwrap().clone()
    }
}

fn workload(name: &'static str, replicas: (i32, i32, i32), available: Option<ConditionStatus>) -> Workload {
    let conditions = available.map(|s| vec![Condition::new(AVAILABLE, s)]).unwrap_or_default();
    Workload { name, expected: replicas.0, updated: replicas.1, available: replicas.2, conditions }
}

fn fleet() -> Recorder {
    Recorder {
        workloads: vec![
            workload("lagging", (3, 3, 2), Some(ConditionStatus::True)),
            workload("healthy", (3, 3, 3), Some(ConditionStatus::True)),
            // Matches both rules; still refreshed once.
            workload("degraded", (3, 2, 1), Some(ConditionStatus::False)),
            workload("unavailable", (1, 1, 1), Some(ConditionStatus::Unknown)),
        ],
        ..Default::default()
    }
}

#[test]
fn scan_refreshes_each_stalled_resource_once() {
    let rec = fleet();
    let n = StatusPoller::default().scan(&rec);
    assert_eq!(n, 3);
    assert_eq!(rec.refreshed(), vec!["lagging", "degraded", "unavailable"]);
}

#[test]
fn later_unavailable_condition_still_triggers_once() {
    let mut w = workload("split", (3, 3, 3), Some(ConditionStatus::True));
    w.conditions.push(Condition::new(AVAILABLE, ConditionStatus::False));
    w.conditions.push(Condition::new(AVAILABLE, ConditionStatus::Unknown));
    let rec = Recorder { workloads: vec![w], ..Default::default() };
    assert_eq!(StatusPoller::default().scan(&rec), 1);
    assert_eq!(rec.refreshed(), vec!["split"]);
}

#[tokio::test(start_paused = true)]
async fn first_tick_fires_one_period_after_start() {
    let rec = Arc::new(fleet());
    let cancel = CancellationToken::new();
    let handle = StatusPoller::new(Duration::from_secs(60)).spawn(Arc::clone(&rec), cancel.clone());

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(rec.refreshed().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rec.refreshed().len(), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(rec.refreshed().len(), 6);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn healthy_fleet_is_left_alone() {
    let rec = Arc::new(Recorder { workloads: vec![workload("healthy", (3, 3, 3), Some(ConditionStatus::True))], ..Default::default() });
    let cancel = CancellationToken::new();
    let handle = StatusPoller::default().spawn(Arc::clone(&rec), cancel.clone());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(rec.refreshed().is_empty());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_loop_before_the_first_tick() {
    let rec = Arc::new(fleet());
    let cancel = CancellationToken::new();
    let handle = StatusPoller::default().spawn(Arc::clone(&rec), cancel.clone());

    cancel.cancel();
    handle.await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(rec.refreshed().is_empty());
}
