use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::fleet::machine::Machine;

/// Tracks last-seen timestamps for the fleet and applies the liveness
/// timeout policy.
///
/// All operations are idempotent and never delete a machine record; a
/// machine that stops heartbeating is only ever reclassified Offline.
#[derive(Debug)]
pub struct HeartbeatTracker {
    machines: HashMap<Uuid, Machine>,
    liveness_timeout_secs: i64,
}

impl HeartbeatTracker {
    pub fn new(liveness_timeout_secs: i64) -> Self {
        Self {
            machines: HashMap::new(),
            liveness_timeout_secs,
        }
    }

    pub fn liveness_timeout_secs(&self) -> i64 {
        self.liveness_timeout_secs
    }

    /// Register a machine, upserting by (group, addr, name).
    ///
    /// Re-registration refreshes `last_seen` and revives an Offline machine;
    /// it never creates a duplicate record.
    pub fn register(
        &mut self,
        group: &str,
        name: &str,
        addr: IpAddr,
        now: DateTime<Utc>,
    ) -> Uuid {
        if let Some(existing) = self
            .machines
            .values_mut()
            .find(|m| m.group == group && m.addr == addr && m.name == name)
        {
            existing.last_seen = now;
            existing.marked_offline = false;
            return existing.id;
        }

        let machine = Machine::new(group.to_string(), name.to_string(), addr, now);
        let id = machine.id;
        tracing::info!(machine_id = %id, group, name, addr = %addr, "Machine registered");
        self.machines.insert(id, machine);
        id
    }

    /// Record a heartbeat. Returns false if the machine is unknown.
    pub fn touch(&mut self, id: Uuid, now: DateTime<Utc>) -> bool {
        if let Some(machine) = self.machines.get_mut(&id) {
            machine.last_seen = now;
            machine.marked_offline = false;
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Machine> {
        self.machines.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.machines.contains_key(&id)
    }

    /// Machines in a group whose last heartbeat is within the timeout,
    /// oldest registration first (deterministic fan-out order).
    pub fn live_in_group(&self, group: &str, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut live: Vec<&Machine> = self
            .machines
            .values()
            .filter(|m| m.group == group && m.is_live(now, self.liveness_timeout_secs))
            .collect();
        live.sort_by_key(|m| (m.created, m.id));
        live.into_iter().map(|m| m.id).collect()
    }

    /// Machines in a group, oldest registration first.
    pub fn in_group(&self, group: &str) -> Vec<&Machine> {
        let mut machines: Vec<&Machine> = self
            .machines
            .values()
            .filter(|m| m.group == group)
            .collect();
        machines.sort_by_key(|m| (m.created, m.id));
        machines
    }

    /// Flip machines whose heartbeat has lapsed into Offline.
    ///
    /// Returns the ids flipped by *this* sweep only, so callers time out
    /// each machine's Active tasks exactly once. Subsequent sweeps skip
    /// machines already marked.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut lapsed = Vec::new();
        for machine in self.machines.values_mut() {
            if !machine.marked_offline && !machine.is_live(now, self.liveness_timeout_secs) {
                machine.marked_offline = true;
                tracing::info!(
                    machine_id = %machine.id,
                    last_seen = %machine.last_seen,
                    "Machine offline, heartbeat lapsed"
                );
                lapsed.push(machine.id);
            }
        }
        lapsed
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
