use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::series::Metrics;

/// Lifecycle state of a measurement task.
///
/// The set is closed and transitions go through [`Task::transition`], which
/// rejects anything outside the table. `Completed` and `TimedOut` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Active,
    Completed,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::TimedOut => "timed_out",
        }
    }

    /// The transition table. `Active -> Active` is the recurring-result
    /// refresh; `Queued -> Completed` is an explicit stop of queued work.
    fn allows(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Queued, Active)
                | (Queued, Completed)
                | (Active, Active)
                | (Active, Completed)
                | (Active, TimedOut)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "active" => Ok(TaskState::Active),
            "completed" => Ok(TaskState::Completed),
            "timed_out" => Ok(TaskState::TimedOut),
            other => Err(HubError::InvalidValue(format!("unknown state: {other}"))),
        }
    }
}

/// Probe options declared when work is submitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Terminate after the first result instead of recurring
    pub oneshot: bool,
    /// Probe over IPv6 (target must support it)
    pub ipv6: bool,
    /// Parallel probe streams, 1..=32
    pub threads: u8,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            oneshot: false,
            ipv6: false,
            threads: 1,
        }
    }
}

impl TaskOptions {
    pub fn validate(&self) -> Result<()> {
        if self.threads < 1 || self.threads > 32 {
            return Err(HubError::InvalidValue(format!(
                "threads out of range: {}",
                self.threads
            )));
        }
        Ok(())
    }
}

/// One unit of measurement work, owned by exactly one machine and aimed at
/// exactly one target.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub target_id: Uuid,
    /// Owning group token, inherited from the machine
    pub group: String,
    pub state: TaskState,
    pub oneshot: bool,
    pub ipv6: bool,
    pub threads: u8,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Most recent accepted result payload
    pub last_result: Option<Metrics>,
}

impl Task {
    pub fn new(
        machine_id: Uuid,
        target_id: Uuid,
        group: String,
        options: TaskOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine_id,
            target_id,
            group,
            state: TaskState::Queued,
            oneshot: options.oneshot,
            ipv6: options.ipv6,
            threads: options.threads,
            created: now,
            modified: now,
            last_result: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Apply a state transition, rejecting anything outside the table.
    pub fn transition(&mut self, to: TaskState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.allows(to) {
            return Err(HubError::InvalidTransition {
                task: self.id,
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        self.modified = now;
        Ok(())
    }
}
