use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::network::ConnId;
use crate::protocol::WorkerReport;

/// Last known telemetry of one connected worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub conn: ConnId,
    pub name: String,
    pub os: String,
    pub machine: String,
    pub cpu_count: u32,
    /// Per-core load in percent.
    pub cpu_load: Vec<f32>,
    /// Total memory in MB.
    pub memory: u64,
    pub memory_load: f32,
    pub disk_available: u64,
    pub disk_load: f32,
    pub disk_free: u64,
    pub active_users: u32,
    pub active_jobs: u32,
    pub programs: BTreeSet<String>,
    /// CPUs the worker itself reports as reserved.
    pub reserved_cpus: u32,
    pub maintenance: bool,
    pub version: String,
    pub last_report: DateTime<Utc>,
}

impl WorkerSnapshot {
    pub fn new(conn: ConnId, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
            os: String::new(),
            machine: String::new(),
            cpu_count: 0,
            cpu_load: Vec::new(),
            memory: 0,
            memory_load: 0.0,
            disk_available: 0,
            disk_load: 0.0,
            disk_free: 0,
            active_users: 0,
            active_jobs: 0,
            programs: BTreeSet::new(),
            reserved_cpus: 0,
            maintenance: false,
            version: String::new(),
            last_report: Utc::now(),
        }
    }

    /// Overwrite every field present in `report`.
    pub fn merge(&mut self, report: WorkerReport) {
        if let Some(os) = report.os {
            self.os = os;
        }
        if let Some(machine) = report.machine {
            self.machine = machine;
        }
        if let Some(cpu_count) = report.cpu_count {
            self.cpu_count = cpu_count;
        }
        if let Some(cpu_load) = report.cpu_load {
            self.cpu_load = cpu_load;
        }
        if let Some(memory) = report.memory {
            self.memory = memory;
        }
        if let Some(memory_load) = report.memory_load {
            self.memory_load = memory_load;
        }
        if let Some(disk_available) = report.disk_available {
            self.disk_available = disk_available;
        }
        if let Some(disk_load) = report.disk_load {
            self.disk_load = disk_load;
        }
        if let Some(disk_free) = report.disk_free {
            self.disk_free = disk_free;
        }
        if let Some(active_users) = report.active_users {
            self.active_users = active_users;
        }
        if let Some(active_jobs) = report.active_jobs {
            self.active_jobs = active_jobs;
        }
        if let Some(programs) = report.programs {
            self.programs = programs;
        }
        if let Some(reserved_cpus) = report.reserved_cpus {
            self.reserved_cpus = reserved_cpus;
        }
        if let Some(maintenance) = report.maintenance {
            self.maintenance = maintenance;
        }
        if let Some(version) = report.version {
            self.version = version;
        }
        self.last_report = Utc::now();
    }

    /// Cores below `threshold` percent load, minus reported and pending reservations.
    pub fn free_cpus(&self, threshold: f32, pending_reservations: u32) -> i64 {
        let idle = self.cpu_load.iter().filter(|load| **load < threshold).count() as i64;
        idle - i64::from(self.reserved_cpus) - i64::from(pending_reservations)
    }
}

/// Outcome of [`WorkerRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First report on this connection.
    New,
    Updated,
    /// First report on this connection for a name another connection still
    /// held. The stale entry was evicted.
    Replaced { stale: ConnId },
}

/// Connection id → worker telemetry, with a name index.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<ConnId, WorkerSnapshot>,
    by_name: HashMap<String, ConnId>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a telemetry report.
    ///
    /// The first report on a connection must carry the worker name. If that
    /// name is still held by another connection, the older entry is evicted
    /// (last writer by name wins). Later reports never rename a worker.
    pub fn upsert(&mut self, conn: ConnId, report: WorkerReport) -> Result<Upsert> {
        if let Some(snapshot) = self.workers.get_mut(&conn) {
            snapshot.merge(report);
            return Ok(Upsert::Updated);
        }

        let name = report
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                FleetError::Protocol(format!("first report on connection {} has no name", conn))
            })?;

        let outcome = match self.by_name.get(&name).copied() {
            Some(stale) if stale != conn => {
                self.workers.remove(&stale);
                tracing::info!(worker = %name, conn, stale, "Worker reconnected, evicting stale entry");
                Upsert::Replaced { stale }
            }
            _ => Upsert::New,
        };

        let mut snapshot = WorkerSnapshot::new(conn, name.clone());
        snapshot.merge(report);
        self.workers.insert(conn, snapshot);
        self.by_name.insert(name, conn);
        Ok(outcome)
    }

    /// Drop the entry held by `conn`.
    pub fn remove(&mut self, conn: ConnId) -> Option<WorkerSnapshot> {
        let snapshot = self.workers.remove(&conn)?;
        if self.by_name.get(&snapshot.name) == Some(&conn) {
            self.by_name.remove(&snapshot.name);
        }
        Some(snapshot)
    }

    pub fn by_name(&self, name: &str) -> Option<ConnId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, conn: ConnId) -> Option<&WorkerSnapshot> {
        self.workers.get(&conn)
    }

    /// All workers, ordered by connection id.
    pub fn all(&self) -> Vec<&WorkerSnapshot> {
        let mut workers: Vec<&WorkerSnapshot> = self.workers.values().collect();
        workers.sort_by_key(|w| w.conn);
        workers
    }

    /// Workers handed to placement, ordered by connection id. Workers in
    /// maintenance stay in the list so placement can log why they were skipped.
    pub fn candidates(&self) -> Vec<WorkerSnapshot> {
        self.all().into_iter().cloned().collect()
    }

    /// Replace the program list of a worker, e.g. after a program probe.
    pub fn merge_programs(&mut self, conn: ConnId, programs: BTreeSet<String>) -> bool {
        match self.workers.get_mut(&conn) {
            Some(snapshot) => {
                snapshot.programs = programs;
                true
            }
            None => false,
        }
    }

    /// Toggle the maintenance flag by worker name.
    pub fn set_maintenance(&mut self, name: &str, maintenance: bool) -> bool {
        let Some(conn) = self.by_name(name) else {
            return false;
        };
        match self.workers.get_mut(&conn) {
            Some(snapshot) => {
                snapshot.maintenance = maintenance;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
