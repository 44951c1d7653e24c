use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Derived liveness status of a machine.
///
/// `Working` means the machine is live and currently owns at least one
/// Active task; the distinction between Ready and Working is computed from
/// the task queue, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    Ready,
    Working,
    Offline,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Ready => write!(f, "ready"),
            MachineStatus::Working => write!(f, "working"),
            MachineStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A registered measurement machine.
#[derive(Debug, Clone, Serialize)]
pub struct Machine {
    pub id: Uuid,
    /// Owning group token (tenant boundary)
    pub group: String,
    /// Name declared by the machine at registration
    pub name: String,
    /// Last known source address
    pub addr: IpAddr,
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Set by the sweep once the liveness timeout has lapsed; cleared on the
    /// next heartbeat. Tracks whether the lapse was already acted upon.
    pub marked_offline: bool,
}

impl Machine {
    pub fn new(group: String, name: String, addr: IpAddr, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group,
            name,
            addr,
            created: now,
            last_seen: now,
            marked_offline: false,
        }
    }

    /// True while the machine's last heartbeat is within the liveness timeout.
    pub fn is_live(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        (now - self.last_seen).num_seconds() <= timeout_secs
    }

    /// Derive the status given whether the machine owns an Active task.
    pub fn status(&self, now: DateTime<Utc>, timeout_secs: i64, has_active: bool) -> MachineStatus {
        if !self.is_live(now, timeout_secs) {
            MachineStatus::Offline
        } else if has_active {
            MachineStatus::Working
        } else {
            MachineStatus::Ready
        }
    }
}
