use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::job::JobId;
use crate::scheduler::placement::PlacementPolicy;

/// Heartbeat cadence and tolerance for worker connections.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between two heartbeats on one connection
    pub interval_ms: u64,
    /// How long a heartbeat may stay unanswered before it counts as missed
    pub timeout_ms: u64,
    /// Consecutive misses after which the connection is declared dead
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_ms: 3_000,
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between dispatch ticks while the queue is non-empty
    pub tick_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15_000,
        }
    }
}

/// UDP discovery beacon settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub broadcast_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(228, 0, 0, 5),
            port: 50_000,
            broadcast_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub working_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    pub discovery: Option<DiscoveryConfig>,
    pub heartbeat: HeartbeatConfig,
    pub dispatch: DispatchConfig,
    pub placement: PlacementPolicy,
    /// Lifetime of an unconfirmed CPU reservation
    pub reservation_ttl_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 49_999)),
            dashboard_addr: None,
            discovery: None,
            heartbeat: HeartbeatConfig::default(),
            dispatch: DispatchConfig::default(),
            placement: PlacementPolicy::default(),
            reservation_ttl_secs: 1_800,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(working_dir: impl Into<PathBuf>, listen_addr: SocketAddr) -> Self {
        Self {
            working_dir: working_dir.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_tick_interval_ms(mut self, tick_interval_ms: u64) -> Self {
        self.dispatch.tick_interval_ms = tick_interval_ms;
        self
    }

    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch.tick_interval_ms)
    }

    // Working directory layout

    pub fn db_path(&self) -> PathBuf {
        self.working_dir.join("coordinator.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.working_dir.join("log")
    }

    pub fn paths_file(&self) -> PathBuf {
        self.working_dir.join("PATHS")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.working_dir.join("temp")
    }

    /// Spool for files arriving over the network.
    pub fn spool_dir(&self) -> PathBuf {
        self.working_dir.join("network")
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.working_dir.join(job_id.to_string())
    }

    pub fn job_logs_dir(&self, job_id: JobId) -> PathBuf {
        self.job_dir(job_id).join("logs")
    }

    pub fn job_results_dir(&self, job_id: JobId) -> PathBuf {
        self.job_dir(job_id).join("results")
    }
}
