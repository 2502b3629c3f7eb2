//! Persistence for jobs, users, programs and compilers.
//!
//! The coordinator owns a single `Arc<dyn Store>`. Every write is durable
//! before the call returns, so a job state that was persisted survives a
//! coordinator restart.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{Job, JobId, JobSpec, JobState, UserId};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub admin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub admin: bool,
}

/// An executable that jobs may require and workers report as installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: u64,
    pub name: String,
    pub executable: String,
    pub path: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewProgram {
    pub name: String,
    pub executable: String,
    pub path: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compiler {
    pub id: u64,
    pub name: String,
    pub description: String,
}

/// Exact-match job query. Unset fields match everything, an empty
/// `states` list matches every state.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<UserId>,
    pub workstation: Option<String>,
    pub states: Vec<JobState>,
}

impl JobFilter {
    pub fn owner(owner: UserId) -> Self {
        Self {
            owner: Some(owner),
            ..Default::default()
        }
    }

    pub fn in_states(states: &[JobState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_workstation(mut self, name: impl Into<String>) -> Self {
        self.workstation = Some(name.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.owner.is_some_and(|owner| owner != job.owner) {
            return false;
        }
        if let Some(name) = &self.workstation {
            if job.workstation.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        self.states.is_empty() || self.states.contains(&job.state)
    }
}

pub trait Store: Send + Sync {
    /// Create a QUEUED job and assign its id.
    fn add_job(&self, owner: UserId, spec: JobSpec) -> Result<Job>;
    fn job(&self, id: JobId) -> Result<Option<Job>>;
    /// Persist the full job record, log included.
    fn save_job(&self, job: &Job) -> Result<()>;
    /// Matching jobs in id order.
    fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    fn add_user(&self, user: NewUser) -> Result<User>;
    fn user(&self, id: UserId) -> Result<Option<User>>;
    fn user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn delete_user(&self, id: UserId) -> Result<bool>;
    fn users(&self) -> Result<Vec<User>>;

    fn add_program(&self, program: NewProgram) -> Result<Program>;
    fn delete_program(&self, name: &str) -> Result<bool>;
    fn programs(&self) -> Result<Vec<Program>>;

    fn add_compiler(&self, name: &str, description: &str) -> Result<Compiler>;
    fn compilers(&self) -> Result<Vec<Compiler>>;
}
