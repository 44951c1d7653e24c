use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{HubError, Result};
use crate::fleet::{HeartbeatTracker, MachineStatus};
use crate::series::store::SeriesStore;
use crate::series::{Metrics, SeriesRow, Window};
use crate::tasks::queue::TaskFilter;
use crate::tasks::{Task, TaskOptions, TaskQueue, TaskState};

/// A measurement target registered in a group's catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub id: Uuid,
    pub group: String,
    pub name: String,
    pub download_url: String,
    pub upload_url: String,
    pub ipv6: bool,
    pub created: DateTime<Utc>,
}

/// Declared target capabilities at registration time.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub download_url: String,
    pub upload_url: String,
    #[serde(default)]
    pub ipv6: bool,
}

impl TargetSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(HubError::InvalidValue("target name invalid".to_string()));
        }
        for (field, url) in [
            ("download_url", &self.download_url),
            ("upload_url", &self.upload_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(HubError::InvalidValue(format!("{field} is not a URL")));
            }
        }
        Ok(())
    }
}

/// Snapshot of one machine plus its derived status.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary {
    pub id: Uuid,
    pub name: String,
    pub addr: IpAddr,
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: MachineStatus,
    pub live_tasks: usize,
}

/// What a sweep did: machines flipped Offline, Active tasks timed out,
/// terminal tasks (and series) purged past retention.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepReport {
    pub machines_offline: usize,
    pub tasks_timed_out: usize,
    pub tasks_purged: usize,
}

/// Fleet registry and task queue, guarded together: the write lock on this
/// pair is the critical section in which a state transition and the
/// promotion of its successor happen atomically.
#[derive(Debug)]
struct CoreState {
    fleet: HeartbeatTracker,
    queue: TaskQueue,
    targets: HashMap<Uuid, Target>,
}

/// Composes the heartbeat tracker, task queue, and series store behind the
/// external contract. Handlers share one instance via `Arc`; there is no
/// ambient global state.
#[derive(Debug)]
pub struct Scheduler {
    config: CoordinatorConfig,
    state: RwLock<CoreState>,
    series: SeriesStore,
}

impl Scheduler {
    pub fn new(config: CoordinatorConfig) -> Self {
        let state = CoreState {
            fleet: HeartbeatTracker::new(config.liveness_timeout_secs),
            queue: TaskQueue::new(config.task_capacity),
            targets: HashMap::new(),
        };
        Self {
            series: SeriesStore::new(config.series),
            config,
            state: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Upsert a machine by (group, source address, declared name).
    pub async fn register_machine(
        &self,
        group: &str,
        name: &str,
        addr: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        validate_group(group)?;
        if name.is_empty() || name.len() > 16 {
            return Err(HubError::InvalidValue("machine name invalid".to_string()));
        }
        let mut state = self.state.write().await;
        Ok(state.fleet.register(group, name, addr, now))
    }

    /// Record a heartbeat for a machine.
    pub async fn heartbeat(&self, machine_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fleet.touch(machine_id, now) {
            Ok(())
        } else {
            Err(HubError::MachineNotFound(machine_id))
        }
    }

    /// Register a target and fan one task out to every live machine in the
    /// group. Per machine the new task becomes Active only when nothing
    /// else is Active for the (machine, group) key; otherwise it queues.
    ///
    /// Returns the target id and the number of tasks created. Machines at
    /// capacity are skipped with a warning; the per-machine submit path
    /// reports `CapacityExceeded` synchronously instead.
    pub async fn register_target(
        &self,
        group: &str,
        spec: TargetSpec,
        options: TaskOptions,
        now: DateTime<Utc>,
    ) -> Result<(Uuid, usize)> {
        validate_group(group)?;
        spec.validate()?;
        options.validate()?;
        if options.ipv6 && !spec.ipv6 {
            return Err(HubError::InvalidValue(
                "target does not support ipv6".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let target = Target {
            id: Uuid::new_v4(),
            group: group.to_string(),
            name: spec.name,
            download_url: spec.download_url,
            upload_url: spec.upload_url,
            ipv6: spec.ipv6,
            created: now,
        };
        let target_id = target.id;
        state.targets.insert(target_id, target);
        tracing::info!(target_id = %target_id, group, "Target registered");

        let mut created = 0;
        for machine_id in state.fleet.live_in_group(group, now) {
            match self
                .enqueue_task(&mut state, machine_id, target_id, group, options, now)
                .await
            {
                Ok(_) => created += 1,
                Err(HubError::CapacityExceeded { machine, limit }) => {
                    tracing::warn!(
                        machine_id = %machine,
                        limit,
                        target_id = %target_id,
                        "Machine at capacity, skipped in fan-out"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok((target_id, created))
    }

    /// Enqueue one task for one machine against an existing target. This is
    /// the user-driven path; capacity overflow is reported to the caller.
    pub async fn submit_single(
        &self,
        group: &str,
        machine_id: Uuid,
        target_id: Uuid,
        options: TaskOptions,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        options.validate()?;
        let mut state = self.state.write().await;

        let machine = state
            .fleet
            .get(machine_id)
            .ok_or(HubError::MachineNotFound(machine_id))?;
        if machine.group != group {
            return Err(HubError::MachineNotFound(machine_id));
        }

        let target = state
            .targets
            .get(&target_id)
            .ok_or(HubError::TargetNotFound(target_id))?;
        if target.group != group {
            return Err(HubError::TargetNotFound(target_id));
        }
        if options.ipv6 && !target.ipv6 {
            return Err(HubError::InvalidValue(
                "target does not support ipv6".to_string(),
            ));
        }

        self.enqueue_task(&mut state, machine_id, target_id, group, options, now)
            .await
    }

    async fn enqueue_task(
        &self,
        state: &mut CoreState,
        machine_id: Uuid,
        target_id: Uuid,
        group: &str,
        options: TaskOptions,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let task = Task::new(machine_id, target_id, group.to_string(), options, now);
        let task_id = task.id;
        state.queue.insert(task)?;
        if let Err(e) = self.series.create(task_id, now).await {
            // Task ids are fresh uuids; a collision here is unrecoverable.
            // Roll the insert back so no task without a series can ever be
            // promoted.
            state.queue.remove(task_id);
            tracing::error!(task_id = %task_id, error = %e, "Series allocation failed");
            return Err(HubError::Internal(format!(
                "series allocation failed for task {task_id}"
            )));
        }
        tracing::info!(task_id = %task_id, machine_id = %machine_id, target_id = %target_id, "Task enqueued");
        state.queue.promote_next(machine_id, group, now);
        Ok(task_id)
    }

    /// Accept a result for an Active task owned by the caller's group.
    ///
    /// The series write is committed before the state transition, inside
    /// the same critical section, so the pair lands together or not at all.
    /// Oneshot tasks complete and their successor is promoted; recurring
    /// tasks refresh in place.
    pub async fn submit_result(
        &self,
        task_id: Uuid,
        group: &str,
        metrics: Metrics,
        now: DateTime<Utc>,
    ) -> Result<TaskState> {
        // Fail fast: a rejected payload must leave no trace anywhere.
        metrics.validate()?;

        let mut state = self.state.write().await;
        let task = state.queue.get(task_id).ok_or(HubError::TaskNotFound(task_id))?;
        if task.group != group {
            // Cross-group probes see "not found", not "exists elsewhere".
            return Err(HubError::TaskNotFound(task_id));
        }
        let machine_id = task.machine_id;
        let oneshot = task.oneshot;
        if !state.fleet.contains(machine_id) {
            tracing::error!(
                task_id = %task_id,
                machine_id = %machine_id,
                "Task references a missing machine; refusing to act"
            );
            return Err(HubError::Internal(format!(
                "task {task_id} references missing machine {machine_id}"
            )));
        }
        if state.queue.get(task_id).map(|t| t.state) != Some(TaskState::Active) {
            tracing::warn!(task_id = %task_id, "Result for non-active task rejected");
            return Err(HubError::TaskNotActive(task_id));
        }

        self.series.record(task_id, &metrics, now).await?;

        state.fleet.touch(machine_id, now);
        let task = state
            .queue
            .get_mut(task_id)
            .ok_or(HubError::TaskNotFound(task_id))?;
        task.last_result = Some(metrics);
        let next_state = if oneshot {
            TaskState::Completed
        } else {
            TaskState::Active
        };
        task.transition(next_state, now)?;
        let group = task.group.clone();
        tracing::debug!(task_id = %task_id, state = %next_state, "Result accepted");

        if next_state.is_terminal() {
            state.queue.promote_next(machine_id, &group, now);
        }
        Ok(next_state)
    }

    /// Explicitly stop a task (terminates recurring work). Queued and
    /// Active tasks complete; terminal tasks report a conflict.
    pub async fn stop_task(&self, task_id: Uuid, group: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let task = state.queue.get(task_id).ok_or(HubError::TaskNotFound(task_id))?;
        if task.group != group {
            return Err(HubError::TaskNotFound(task_id));
        }
        let was_active = task.state == TaskState::Active;
        let machine_id = task.machine_id;

        let task = state
            .queue
            .get_mut(task_id)
            .ok_or(HubError::TaskNotFound(task_id))?;
        task.transition(TaskState::Completed, now)?;
        let group = task.group.clone();
        tracing::info!(task_id = %task_id, "Task stopped");

        if was_active {
            state.queue.promote_next(machine_id, &group, now);
        }
        Ok(())
    }

    /// Targets in the caller's group in creation order. This is how a probe
    /// machine learns the URLs and capabilities behind its tasks.
    pub async fn list_targets(&self, group: &str) -> Vec<Target> {
        let state = self.state.read().await;
        let mut targets: Vec<Target> = state
            .targets
            .values()
            .filter(|t| t.group == group)
            .cloned()
            .collect();
        targets.sort_by_key(|t| (t.created, t.id));
        targets
    }

    /// One target by id, scoped to the caller's group.
    pub async fn get_target(&self, target_id: Uuid, group: &str) -> Result<Target> {
        let state = self.state.read().await;
        state
            .targets
            .get(&target_id)
            .filter(|t| t.group == group)
            .cloned()
            .ok_or(HubError::TargetNotFound(target_id))
    }

    /// Tasks in the caller's group, optionally filtered, in creation order.
    pub async fn list_tasks(&self, group: &str, filter: TaskFilter) -> Vec<Task> {
        let state = self.state.read().await;
        state
            .queue
            .filtered(group, filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Machines in the caller's group with derived status.
    pub async fn list_machines(&self, group: &str, now: DateTime<Utc>) -> Vec<MachineSummary> {
        let state = self.state.read().await;
        state
            .fleet
            .in_group(group)
            .into_iter()
            .map(|m| {
                let has_active = !state.queue.active_for_machine(m.id).is_empty();
                MachineSummary {
                    id: m.id,
                    name: m.name.clone(),
                    addr: m.addr,
                    created: m.created,
                    last_seen: m.last_seen,
                    status: m.status(now, self.config.liveness_timeout_secs, has_active),
                    live_tasks: state.queue.live_count(m.id),
                }
            })
            .collect()
    }

    /// Resampled rows for a task's series over one of the fixed windows,
    /// ending at `now`.
    pub async fn fetch_series(
        &self,
        task_id: Uuid,
        group: &str,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeriesRow>> {
        {
            let state = self.state.read().await;
            let task = state.queue.get(task_id).ok_or(HubError::TaskNotFound(task_id))?;
            if task.group != group {
                return Err(HubError::TaskNotFound(task_id));
            }
        }
        let span = match window {
            Window::Recent => self.config.series.recent.span_secs(),
            Window::Medium => self.config.series.medium.span_secs(),
            Window::Long => self.config.series.long.span_secs(),
        };
        let start = now - chrono::Duration::seconds(span);
        self.series.fetch(task_id, window, start, now).await
    }

    /// Periodic staleness pass: lapsed machines go Offline and their Active
    /// tasks time out (promoting successors); Active tasks past the result
    /// deadline time out likewise; terminal tasks past retention are purged
    /// together with their series.
    ///
    /// Timeouts are expected, not exceptional: they are logged and drive
    /// normal transitions, never surfaced as caller errors.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        // Flip lapsed machines and collect their active tasks. Held briefly;
        // the actual transitions run in their own critical sections below.
        let mut stale: Vec<(Uuid, Uuid, String)> = Vec::new();
        {
            let mut state = self.state.write().await;
            let lapsed = state.fleet.sweep(now);
            report.machines_offline = lapsed.len();
            for machine_id in lapsed {
                let group = match state.fleet.get(machine_id) {
                    Some(m) => m.group.clone(),
                    None => continue,
                };
                for task_id in state.queue.active_for_machine(machine_id) {
                    stale.push((task_id, machine_id, group.clone()));
                }
            }
        }

        // Overdue actives need no mutation to collect.
        {
            let state = self.state.read().await;
            for task_id in state.queue.active_overdue(now, self.config.active_deadline_secs) {
                let Some(task) = state.queue.get(task_id) else {
                    continue;
                };
                if !state.fleet.contains(task.machine_id) {
                    // Invariant violation: never guess, flag and skip.
                    tracing::error!(
                        task_id = %task_id,
                        machine_id = %task.machine_id,
                        "Task references a missing machine; refusing to act"
                    );
                    continue;
                }
                stale.push((task_id, task.machine_id, task.group.clone()));
            }
        }

        // One short critical section per task, so a long sweep never blocks
        // ingestion. Each transition rechecks under its own lock: a result
        // that landed since collection wins and the timeout is skipped; a
        // task collected twice (lapsed machine and overdue) counts once.
        for (task_id, machine_id, group) in stale {
            let mut state = self.state.write().await;
            if self.time_out_task(&mut state, task_id, machine_id, &group, now) {
                report.tasks_timed_out += 1;
            }
        }

        let purged = {
            let mut state = self.state.write().await;
            state.queue.purge_expired(now, self.config.retention_secs)
        };
        report.tasks_purged = purged.len();
        for task_id in purged {
            self.series.remove(task_id).await;
            tracing::debug!(task_id = %task_id, "Expired task and series purged");
        }
        report
    }

    fn time_out_task(
        &self,
        state: &mut CoreState,
        task_id: Uuid,
        machine_id: Uuid,
        group: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(task) = state.queue.get_mut(task_id) else {
            return false;
        };
        if task.state != TaskState::Active {
            // A result or stop landed between collection and this section.
            tracing::debug!(task_id = %task_id, state = %task.state, "Timeout skipped, task no longer active");
            return false;
        }
        if let Err(e) = task.transition(TaskState::TimedOut, now) {
            tracing::error!(task_id = %task_id, error = %e, "Timeout transition refused");
            return false;
        }
        tracing::info!(task_id = %task_id, machine_id = %machine_id, "Active task timed out");
        state.queue.promote_next(machine_id, group, now);
        true
    }
}

fn validate_group(group: &str) -> Result<()> {
    let ok = !group.is_empty()
        && group.len() <= 64
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(HubError::InvalidValue("group token invalid".to_string()))
    }
}
