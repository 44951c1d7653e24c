use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::tasks::task::{Task, TaskState};

/// Optional filters for task listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub machine_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    pub state: Option<TaskState>,
}

/// Holds every task and enforces the per-(machine, group) sequencing rules.
///
/// The queue itself is not synchronized; the scheduler wraps it in the lock
/// that forms the critical section for transition-plus-promotion.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    /// Maximum Queued+Active tasks per machine
    capacity_per_machine: usize,
}

impl TaskQueue {
    pub fn new(capacity_per_machine: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            capacity_per_machine,
        }
    }

    pub fn capacity_per_machine(&self) -> usize {
        self.capacity_per_machine
    }

    /// Number of live (Queued or Active) tasks owned by a machine.
    pub fn live_count(&self, machine_id: Uuid) -> usize {
        self.tasks
            .values()
            .filter(|t| t.machine_id == machine_id && t.is_live())
            .count()
    }

    /// True if the machine already has an Active task in the group.
    pub fn has_active(&self, machine_id: Uuid, group: &str) -> bool {
        self.tasks
            .values()
            .any(|t| t.machine_id == machine_id && t.group == group && t.state == TaskState::Active)
    }

    /// Insert a new task, rejecting with `CapacityExceeded` when the owning
    /// machine is already at its live-task limit.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.live_count(task.machine_id) >= self.capacity_per_machine {
            return Err(HubError::CapacityExceeded {
                machine: task.machine_id,
                limit: self.capacity_per_machine,
            });
        }
        self.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Remove a task outright, freeing its capacity slot. Used to roll back
    /// an insert whose companion series allocation failed.
    pub fn remove(&mut self, id: Uuid) -> Option<Task> {
        self.tasks.remove(&id)
    }

    /// Promote the single oldest Queued task for the key to Active.
    ///
    /// Does nothing if another task is already Active for the key; among
    /// Queued competitors selection is strict creation order. Returns the
    /// promoted task id, if any.
    pub fn promote_next(
        &mut self,
        machine_id: Uuid,
        group: &str,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        if self.has_active(machine_id, group) {
            return None;
        }
        let next = self
            .tasks
            .values()
            .filter(|t| {
                t.machine_id == machine_id && t.group == group && t.state == TaskState::Queued
            })
            .min_by_key(|t| (t.created, t.id))?
            .id;

        // Queued -> Active is always in the table; recover loudly if not.
        if let Some(task) = self.tasks.get_mut(&next) {
            if let Err(e) = task.transition(TaskState::Active, now) {
                tracing::error!(task_id = %next, error = %e, "Promotion refused by transition table");
                return None;
            }
        }
        tracing::info!(task_id = %next, machine_id = %machine_id, group, "Task promoted to active");
        Some(next)
    }

    /// Ids of Active tasks owned by a machine.
    pub fn active_for_machine(&self, machine_id: Uuid) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| t.machine_id == machine_id && t.state == TaskState::Active)
            .map(|t| t.id)
            .collect()
    }

    /// Active tasks whose last modification is older than the deadline.
    pub fn active_overdue(&self, now: DateTime<Utc>, deadline_secs: i64) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Active && (now - t.modified).num_seconds() > deadline_secs
            })
            .map(|t| t.id)
            .collect()
    }

    /// Tasks in a group matching the filter, creation order.
    pub fn filtered(&self, group: &str, filter: TaskFilter) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.group == group)
            .filter(|t| filter.machine_id.map_or(true, |m| t.machine_id == m))
            .filter(|t| filter.target_id.map_or(true, |s| t.target_id == s))
            .filter(|t| filter.state.map_or(true, |s| t.state == s))
            .collect();
        tasks.sort_by_key(|t| (t.created, t.id));
        tasks
    }

    /// Remove terminal tasks whose retention has expired. Returns the
    /// removed ids so the caller can drop their series as well.
    pub fn purge_expired(&mut self, now: DateTime<Utc>, retention_secs: i64) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| {
                t.state.is_terminal() && (now - t.modified).num_seconds() > retention_secs
            })
            .map(|t| t.id)
            .collect();
        for id in &expired {
            self.tasks.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
