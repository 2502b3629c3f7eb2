use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod state;

pub use state::JobState;

pub type JobId = u64;
pub type UserId = u64;

/// Scheduling requirements a workstation has to satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRequirements {
    pub min_cpu: u32,
    /// Minimum memory in KB.
    pub min_memory: u64,
    pub required_os: Option<String>,
    pub required_programs: BTreeSet<String>,
    pub multi_cpu: bool,
}

impl Default for JobRequirements {
    fn default() -> Self {
        Self {
            min_cpu: 1,
            min_memory: 0,
            required_os: None,
            required_programs: BTreeSet::new(),
            multi_cpu: false,
        }
    }
}

/// What a user submits; the store turns it into a [`Job`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSpec {
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub requirements: JobRequirements,
    pub compiler_command: Option<String>,
    pub execute_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: String,
    pub owner: UserId,
    pub requirements: JobRequirements,
    pub compiler_command: Option<String>,
    pub execute_command: String,
    pub added: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub state: JobState,
    pub workstation: Option<String>,
    #[serde(default)]
    log: Vec<LogEntry>,
}

impl Job {
    pub fn new(id: JobId, owner: UserId, spec: JobSpec) -> Self {
        Self {
            id,
            name: spec.name,
            description: spec.description,
            owner,
            requirements: spec.requirements,
            compiler_command: spec
                .compiler_command
                .filter(|command| !command.trim().is_empty()),
            execute_command: spec.execute_command,
            added: Some(Utc::now()),
            started: None,
            finished: None,
            state: JobState::Queued,
            workstation: None,
            log: Vec::new(),
        }
    }

    /// Append a line to the job log.
    pub fn log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// Move the job forward to `to`.
    ///
    /// Only forward moves are accepted, plus re-entering
    /// `WaitingForWorkstation` for a job that is still waiting. Entering
    /// `Running` stamps `started`, entering a terminal state stamps `finished`.
    pub fn advance(&mut self, to: JobState) -> bool {
        let retry = to == JobState::WaitingForWorkstation && self.state == to;
        if to <= self.state && !retry {
            return false;
        }

        self.state = to;
        if to == JobState::Running && self.started.is_none() {
            self.started = Some(Utc::now());
        }
        if (JobState::Done..JobState::ArchivedDone).contains(&to) && self.finished.is_none() {
            self.finished = Some(Utc::now());
        }
        true
    }
}
