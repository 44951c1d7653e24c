//! End-to-end scenarios against the scheduler contract: fan-out admission,
//! promotion order, result idempotence, liveness timeouts, and capacity.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use probehub::config::CoordinatorConfig;
use probehub::error::{ErrorKind, HubError};
use probehub::fleet::MachineStatus;
use probehub::scheduler::{Scheduler, TargetSpec};
use probehub::series::{Metrics, Window};
use probehub::tasks::queue::TaskFilter;
use probehub::tasks::{TaskOptions, TaskState};

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn scheduler() -> Scheduler {
    Scheduler::new(CoordinatorConfig::default())
}

fn spec(name: &str) -> TargetSpec {
    TargetSpec {
        name: name.to_string(),
        download_url: format!("https://{name}.example.com/download"),
        upload_url: format!("https://{name}.example.com/upload"),
        ipv6: false,
    }
}

fn oneshot() -> TaskOptions {
    TaskOptions {
        oneshot: true,
        ..Default::default()
    }
}

fn metrics() -> Metrics {
    Metrics {
        download: 850.123,
        upload: 102.4,
        latency: 11.7,
        jitter: 0.9,
        loss: 0.1,
    }
}

fn by_state(state: TaskState) -> TaskFilter {
    TaskFilter {
        state: Some(state),
        ..Default::default()
    }
}

async fn register_machine(s: &Scheduler, group: &str, name: &str, now: DateTime<Utc>) -> Uuid {
    s.register_machine(group, name, "10.0.0.1".parse().unwrap(), now)
        .await
        .unwrap()
}

#[tokio::test]
async fn first_target_activates_immediately() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;

    let (_, created) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    assert_eq!(created, 1);

    let active = s.list_tasks("g", by_state(TaskState::Active)).await;
    let queued = s.list_tasks("g", by_state(TaskState::Queued)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].machine_id, m1);
    assert!(queued.is_empty());
}

#[tokio::test]
async fn second_target_queues_behind_the_first() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;

    let (t1, _) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    let (t2, _) = s
        .register_target("g", spec("t2"), oneshot(), now + Duration::seconds(1))
        .await
        .unwrap();

    let active = s.list_tasks("g", by_state(TaskState::Active)).await;
    let queued = s.list_tasks("g", by_state(TaskState::Queued)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].target_id, t1, "first registered stays active");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].target_id, t2);
    assert_eq!(queued[0].machine_id, m1);
}

#[tokio::test]
async fn completion_promotes_the_queued_task_in_the_same_call() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;

    let (t1, _) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    let (t2, _) = s
        .register_target("g", spec("t2"), oneshot(), now + Duration::seconds(1))
        .await
        .unwrap();

    let active = s.list_tasks("g", by_state(TaskState::Active)).await;
    let state = s
        .submit_result(active[0].id, "g", metrics(), now + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Completed);

    // ListTasks reflects the promotion immediately
    let active = s.list_tasks("g", by_state(TaskState::Active)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].target_id, t2);
    assert!(s.list_tasks("g", by_state(TaskState::Queued)).await.is_empty());

    let completed = s.list_tasks("g", by_state(TaskState::Completed)).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].target_id, t1);
}

#[tokio::test]
async fn duplicate_result_is_a_conflict() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();

    let task_id = s.list_tasks("g", by_state(TaskState::Active)).await[0].id;
    s.submit_result(task_id, "g", metrics(), now + Duration::seconds(10))
        .await
        .unwrap();

    // The identical submission applied once; the replay is rejected
    let err = s
        .submit_result(task_id, "g", metrics(), now + Duration::seconds(11))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::TaskNotActive(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn recurring_task_stays_active_and_records_samples() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), TaskOptions::default(), now)
        .await
        .unwrap();

    let task_id = s.list_tasks("g", by_state(TaskState::Active)).await[0].id;
    for i in 1..=3 {
        let state = s
            .submit_result(task_id, "g", metrics(), now + Duration::hours(i))
            .await
            .unwrap();
        assert_eq!(state, TaskState::Active);
    }

    let rows = s
        .fetch_series(task_id, "g", Window::Recent, now + Duration::hours(3))
        .await
        .unwrap();
    let written = rows.iter().filter(|r| r.value.is_some()).count();
    assert_eq!(written, 3);
    assert_eq!(rows.iter().flat_map(|r| r.value).next().unwrap().download, 850.12);

    let task = &s.list_tasks("g", by_state(TaskState::Active)).await[0];
    assert!(task.last_result.is_some());

    // Explicit stop terminates recurring work
    s.stop_task(task_id, "g", now + Duration::hours(4)).await.unwrap();
    assert!(s.list_tasks("g", by_state(TaskState::Active)).await.is_empty());
}

#[tokio::test]
async fn invalid_result_leaves_task_and_series_untouched() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();

    let task_id = s.list_tasks("g", by_state(TaskState::Active)).await[0].id;
    let mut bad = metrics();
    bad.latency = -3.0;

    let at = now + Duration::hours(1);
    let err = s.submit_result(task_id, "g", bad, at).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);

    // Still active, nothing written: the transition and the series write
    // commit together or not at all
    let tasks = s.list_tasks("g", by_state(TaskState::Active)).await;
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].last_result.is_none());
    let rows = s.fetch_series(task_id, "g", Window::Recent, at).await.unwrap();
    assert!(rows.iter().all(|r| r.value.is_none()));
}

#[tokio::test]
async fn results_are_scoped_to_the_owning_group() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();

    let task_id = s.list_tasks("g", by_state(TaskState::Active)).await[0].id;

    let err = s
        .submit_result(task_id, "other", metrics(), now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = s
        .fetch_series(task_id, "other", Window::Recent, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn sweep_times_out_silent_machine_and_promotes_successor() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;

    let (t1, _) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    let (t2, _) = s
        .register_target("g", spec("t2"), oneshot(), now + Duration::seconds(1))
        .await
        .unwrap();

    // No heartbeat past the 60s liveness timeout
    let later = now + Duration::seconds(120);
    let report = s.sweep(later).await;
    assert_eq!(report.machines_offline, 1);
    assert_eq!(report.tasks_timed_out, 1);

    let timed_out = s.list_tasks("g", by_state(TaskState::TimedOut)).await;
    assert_eq!(timed_out.len(), 1);
    assert_eq!(timed_out[0].target_id, t1);

    // Successor promoted without any caller action
    let active = s.list_tasks("g", by_state(TaskState::Active)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].target_id, t2);

    let machines = s.list_machines("g", later).await;
    assert_eq!(machines[0].id, m1);
    assert_eq!(machines[0].status, MachineStatus::Offline);

    // The machine record survives and can come back
    s.heartbeat(m1, later + Duration::seconds(5)).await.unwrap();
    let machines = s.list_machines("g", later + Duration::seconds(6)).await;
    assert_eq!(machines[0].status, MachineStatus::Working);
}

#[tokio::test]
async fn sweep_times_out_overdue_active_task_of_live_machine() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();

    // Machine keeps heartbeating but never delivers a result
    let later = now + Duration::seconds(3_700);
    s.heartbeat(m1, later).await.unwrap();

    let report = s.sweep(later).await;
    assert_eq!(report.machines_offline, 0);
    assert_eq!(report.tasks_timed_out, 1);
    assert_eq!(s.list_tasks("g", by_state(TaskState::TimedOut)).await.len(), 1);
}

#[tokio::test]
async fn machine_at_capacity_rejects_the_sixteenth_task() {
    let s = scheduler();
    let now = t0();

    // Target first so fan-out creates nothing
    let (target, created) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    assert_eq!(created, 0);

    let m1 = register_machine(&s, "g", "m1", now).await;
    for i in 0..15 {
        s.submit_single("g", m1, target, oneshot(), now + Duration::seconds(i))
            .await
            .unwrap();
    }

    let err = s
        .submit_single("g", m1, target, oneshot(), now + Duration::seconds(20))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::CapacityExceeded { limit: 15, .. }));

    // The 15 admitted tasks are unaffected: one active, fourteen queued
    assert_eq!(s.list_tasks("g", by_state(TaskState::Active)).await.len(), 1);
    assert_eq!(s.list_tasks("g", by_state(TaskState::Queued)).await.len(), 14);
}

#[tokio::test]
async fn concurrent_submissions_respect_capacity() {
    let s = Arc::new(scheduler());
    let now = t0();

    // Target first so fan-out creates nothing
    let (target, created) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    assert_eq!(created, 0);
    let m1 = register_machine(&s, "g", "m1", now).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let s = Arc::clone(&s);
        handles.push(tokio::spawn(async move {
            s.submit_single("g", m1, target, oneshot(), now).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(HubError::CapacityExceeded { limit: 15, .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 15);
    assert_eq!(rejected, 1);

    // Whatever the interleaving, exactly one task went active
    assert_eq!(s.list_tasks("g", by_state(TaskState::Active)).await.len(), 1);
    assert_eq!(s.list_tasks("g", by_state(TaskState::Queued)).await.len(), 14);
}

#[tokio::test]
async fn result_submission_races_the_timeout_sweep() {
    let s = Arc::new(scheduler());
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    s.register_target("g", spec("t2"), oneshot(), now + Duration::seconds(1))
        .await
        .unwrap();
    let task_id = s.list_tasks("g", by_state(TaskState::Active)).await[0].id;

    // At this instant the machine has lapsed and the task is overdue, so
    // the sweep and the late result contend for the same transition
    let later = now + Duration::seconds(3_700);
    let submit = tokio::spawn({
        let s = Arc::clone(&s);
        async move { s.submit_result(task_id, "g", metrics(), later).await }
    });
    let sweep = tokio::spawn({
        let s = Arc::clone(&s);
        async move { s.sweep(later).await }
    });
    let submitted = submit.await.unwrap();
    let report = sweep.await.unwrap();

    let task = s
        .list_tasks("g", TaskFilter::default())
        .await
        .into_iter()
        .find(|t| t.id == task_id)
        .unwrap();
    match submitted {
        Ok(state) => {
            assert_eq!(state, TaskState::Completed);
            assert_eq!(task.state, TaskState::Completed);
            assert_eq!(report.tasks_timed_out, 0);
        }
        Err(e) => {
            assert!(matches!(e, HubError::TaskNotActive(_)));
            assert_eq!(task.state, TaskState::TimedOut);
            assert_eq!(report.tasks_timed_out, 1);
        }
    }

    // Exactly one side won and exactly one successor was promoted
    assert_eq!(s.list_tasks("g", by_state(TaskState::Active)).await.len(), 1);
}

#[tokio::test]
async fn sweep_counts_a_doubly_stale_task_once() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();

    // Machine silent past liveness and the task past its result deadline:
    // both sweep phases see it, the timeout lands once
    let report = s.sweep(now + Duration::seconds(3_700)).await;
    assert_eq!(report.machines_offline, 1);
    assert_eq!(report.tasks_timed_out, 1);
    assert_eq!(s.list_tasks("g", by_state(TaskState::TimedOut)).await.len(), 1);
}

#[tokio::test]
async fn targets_are_listed_per_group_in_creation_order() {
    let s = scheduler();
    let now = t0();

    let (t1, _) = s
        .register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();
    let (t2, _) = s
        .register_target("g", spec("t2"), oneshot(), now + Duration::seconds(1))
        .await
        .unwrap();
    s.register_target("other", spec("t3"), oneshot(), now)
        .await
        .unwrap();

    let targets = s.list_targets("g").await;
    assert_eq!(targets.iter().map(|t| t.id).collect::<Vec<_>>(), vec![t1, t2]);
    assert_eq!(targets[0].download_url, "https://t1.example.com/download");
    assert_eq!(targets[0].upload_url, "https://t1.example.com/upload");

    let found = s.get_target(t1, "g").await.unwrap();
    assert_eq!(found.name, "t1");

    // Scoped lookups never leak across groups
    let err = s.get_target(t1, "other").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(s.list_targets("nobody").await.len(), 0);
}

#[tokio::test]
async fn promotions_follow_creation_order_across_completions() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;

    let mut targets = Vec::new();
    for i in 0..4 {
        let (t, _) = s
            .register_target("g", spec(&format!("t{i}")), oneshot(), now + Duration::seconds(i))
            .await
            .unwrap();
        targets.push(t);
    }

    for expected in targets {
        let active = s.list_tasks("g", by_state(TaskState::Active)).await;
        assert_eq!(active.len(), 1, "exactly one active per machine/group");
        assert_eq!(active[0].machine_id, m1);
        assert_eq!(active[0].target_id, expected, "strict creation order");
        s.submit_result(active[0].id, "g", metrics(), now + Duration::hours(1))
            .await
            .unwrap();
    }
    assert!(s.list_tasks("g", by_state(TaskState::Active)).await.is_empty());
}

#[tokio::test]
async fn fan_out_skips_offline_machines() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;
    let m2 = s
        .register_machine("g", "m2", "10.0.0.2".parse().unwrap(), now)
        .await
        .unwrap();

    // m2 registered long ago and went silent
    let later = now + Duration::seconds(300);
    s.heartbeat(m1, later).await.unwrap();

    let (_, created) = s
        .register_target("g", spec("t1"), oneshot(), later)
        .await
        .unwrap();
    assert_eq!(created, 1);

    let tasks = s.list_tasks("g", TaskFilter::default()).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].machine_id, m1);
    assert_ne!(tasks[0].machine_id, m2);
}

#[tokio::test]
async fn sweep_purges_expired_terminal_tasks_and_series() {
    let s = scheduler();
    let now = t0();
    register_machine(&s, "g", "m1", now).await;
    s.register_target("g", spec("t1"), oneshot(), now)
        .await
        .unwrap();

    let task_id = s.list_tasks("g", by_state(TaskState::Active)).await[0].id;
    s.submit_result(task_id, "g", metrics(), now + Duration::seconds(10))
        .await
        .unwrap();

    // Past the 24h retention window (machine lapse in between is fine)
    let report = s.sweep(now + Duration::hours(25)).await;
    assert_eq!(report.tasks_purged, 1);
    assert!(s.list_tasks("g", TaskFilter::default()).await.is_empty());

    let err = s
        .fetch_series(task_id, "g", Window::Recent, now + Duration::hours(25))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn ipv6_probe_requires_ipv6_target() {
    let s = scheduler();
    let now = t0();
    let m1 = register_machine(&s, "g", "m1", now).await;

    let (target, _) = s
        .register_target("g", spec("t4only"), oneshot(), now)
        .await
        .unwrap();

    let opts = TaskOptions {
        ipv6: true,
        ..Default::default()
    };
    let err = s
        .submit_single("g", m1, target, opts, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}
