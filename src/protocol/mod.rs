//! Line-delimited JSON wire protocol.
//!
//! Every frame is one JSON object on one line with a `command` discriminator.
//! File payloads are the exception: after a `put` header the sender writes
//! `chunk` frames and closes the transfer with the bare [`EOF_MARKER`] line.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::job::{JobId, JobSpec, JobState};
use crate::scheduler::placement::PlacementPolicy;
use crate::store::{NewProgram, NewUser};

/// Terminates a chunked file transfer.
pub const EOF_MARKER: &str = "/EOF";

/// Telemetry a worker reports. Absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerReport {
    pub name: Option<String>,
    pub os: Option<String>,
    pub machine: Option<String>,
    pub cpu_count: Option<u32>,
    pub cpu_load: Option<Vec<f32>>,
    /// Total memory in MB.
    pub memory: Option<u64>,
    pub memory_load: Option<f32>,
    pub disk_available: Option<u64>,
    pub disk_load: Option<f32>,
    pub disk_free: Option<u64>,
    pub active_users: Option<u32>,
    pub active_jobs: Option<u32>,
    pub programs: Option<BTreeSet<String>>,
    pub reserved_cpus: Option<u32>,
    pub maintenance: Option<bool>,
    pub version: Option<String>,
}

/// Header of a chunked file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    pub job_id: JobId,
    pub filename: String,
    /// SHA-256 of the whole file, lowercase hex.
    pub checksum: String,
    pub size: u64,
}

/// Frames the coordinator accepts from workers and clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Inbound {
    // Worker traffic
    WorkstationInfo(WorkerReport),
    JobInfo {
        job_id: JobId,
        state: JobState,
    },
    Heartbeat,
    HeartbeatResponse,
    PutFinished {
        job_id: JobId,
        filename: String,
    },
    Put(FileHeader),
    Chunk {
        data: String,
    },
    Ping,

    // Client requests
    SubmitJob {
        username: String,
        job: JobSpec,
        #[serde(default)]
        await_upload: bool,
    },
    GetJobs {
        username: String,
        #[serde(default)]
        show_all: bool,
        #[serde(default)]
        all_users: bool,
    },
    GetJob {
        username: String,
        job_id: JobId,
    },
    GetLog {
        username: String,
        job_id: JobId,
    },
    KillJob {
        username: String,
        job_id: JobId,
    },
    PauseJob {
        username: String,
        job_id: JobId,
    },
    ResumeJob {
        username: String,
        job_id: JobId,
    },
    DeleteJob {
        username: String,
        job_id: JobId,
    },
    ArchiveJob {
        username: String,
        job_id: JobId,
    },
    GetResults {
        username: String,
        job_id: JobId,
    },
    CheckUser {
        username: String,
    },
    GetWorkstations {
        username: String,
    },
    GetCompilers {
        username: String,
    },
    GetPrograms {
        username: String,
    },
    GetSchedulingParameters {
        username: String,
    },
    Schedule {
        username: String,
    },
    CheckJobs {
        username: String,
    },
    CreateUser {
        username: String,
        user: NewUser,
    },
    DeleteUser {
        username: String,
        email: String,
    },
    AddProgram {
        username: String,
        program: NewProgram,
    },
    DeleteProgram {
        username: String,
        name: String,
    },
    AddCompiler {
        username: String,
        name: String,
        #[serde(default)]
        description: String,
    },
    AddPath {
        username: String,
        path: String,
    },
    SetMaintenance {
        username: String,
        workstation: String,
        maintenance: bool,
    },
    UpdateSchedulingParameters {
        username: String,
        parameters: PlacementPolicy,
    },
    Shutdown {
        username: String,
    },
}

impl Inbound {
    /// Decode one line. Unknown commands and malformed frames are errors.
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| FleetError::Protocol(e.to_string()))
    }

    /// The requesting user, for client requests.
    pub fn username(&self) -> Option<&str> {
        match self {
            Inbound::SubmitJob { username, .. }
            | Inbound::GetJobs { username, .. }
            | Inbound::GetJob { username, .. }
            | Inbound::GetLog { username, .. }
            | Inbound::KillJob { username, .. }
            | Inbound::PauseJob { username, .. }
            | Inbound::ResumeJob { username, .. }
            | Inbound::DeleteJob { username, .. }
            | Inbound::ArchiveJob { username, .. }
            | Inbound::GetResults { username, .. }
            | Inbound::CheckUser { username }
            | Inbound::GetWorkstations { username }
            | Inbound::GetCompilers { username }
            | Inbound::GetPrograms { username }
            | Inbound::GetSchedulingParameters { username }
            | Inbound::Schedule { username }
            | Inbound::CheckJobs { username }
            | Inbound::CreateUser { username, .. }
            | Inbound::DeleteUser { username, .. }
            | Inbound::AddProgram { username, .. }
            | Inbound::DeleteProgram { username, .. }
            | Inbound::AddCompiler { username, .. }
            | Inbound::AddPath { username, .. }
            | Inbound::SetMaintenance { username, .. }
            | Inbound::UpdateSchedulingParameters { username, .. }
            | Inbound::Shutdown { username } => Some(username),
            Inbound::WorkstationInfo(_)
            | Inbound::JobInfo { .. }
            | Inbound::Heartbeat
            | Inbound::HeartbeatResponse
            | Inbound::PutFinished { .. }
            | Inbound::Put(_)
            | Inbound::Chunk { .. }
            | Inbound::Ping => None,
        }
    }
}

/// Frames the coordinator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Outbound {
    Heartbeat,
    HeartbeatResponse,
    CheckForPrograms {
        programs: Vec<String>,
    },
    UpdatePath {
        path: String,
    },
    GetJobState {
        job_id: JobId,
    },
    AddJob {
        job_id: JobId,
        job_name: String,
        execute_command: String,
        min_cpu: u32,
        multi_cpu: bool,
        required_programs: Vec<String>,
    },
    KillJob {
        job_id: JobId,
    },
    PauseJob {
        job_id: JobId,
    },
    ResumeJob {
        job_id: JobId,
    },
    GetResults {
        job_id: JobId,
    },
    Put(FileHeader),
    Chunk {
        data: String,
    },
    ServerAvailable {
        end_com: bool,
    },
    /// Answer to a client request. Always closes the exchange.
    Response {
        result: bool,
        end_com: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

impl Outbound {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Outbound::Response {
            result: true,
            end_com: true,
            message: None,
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Outbound::Response {
            result: false,
            end_com: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn server_available() -> Self {
        Outbound::ServerAvailable { end_com: true }
    }

    /// Encode as a single line without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
