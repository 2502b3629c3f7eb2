use serde::{Deserialize, Serialize};

/// Lifecycle stage of a job.
///
/// Declaration order is the stage order: `state >= JobState::Done` means the
/// job has finished executing one way or another, `state >= ArchivedDone`
/// means it has been archived, and `Deleted` sorts after everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Prepared,
    WaitingForWorkstation,
    Compiled,
    Dispatched,
    Running,
    Done,
    Aborted,
    SchedulerError,
    CompilerError,
    WorkstationError,
    PermissionDenied,
    Error,
    ArchivedDone,
    ArchivedAborted,
    ArchivedSchedulerError,
    ArchivedCompilerError,
    ArchivedWorkstationError,
    ArchivedPermissionDenied,
    ArchivedError,
    Deleted,
}

impl JobState {
    pub const ALL: [JobState; 21] = [
        JobState::Queued,
        JobState::Prepared,
        JobState::WaitingForWorkstation,
        JobState::Compiled,
        JobState::Dispatched,
        JobState::Running,
        JobState::Done,
        JobState::Aborted,
        JobState::SchedulerError,
        JobState::CompilerError,
        JobState::WorkstationError,
        JobState::PermissionDenied,
        JobState::Error,
        JobState::ArchivedDone,
        JobState::ArchivedAborted,
        JobState::ArchivedSchedulerError,
        JobState::ArchivedCompilerError,
        JobState::ArchivedWorkstationError,
        JobState::ArchivedPermissionDenied,
        JobState::ArchivedError,
        JobState::Deleted,
    ];

    /// Stable numeric id used in the job table.
    pub fn id(self) -> u16 {
        match self {
            JobState::Queued => 0,
            JobState::Prepared => 10,
            JobState::WaitingForWorkstation => 20,
            JobState::Compiled => 30,
            JobState::Dispatched => 40,
            JobState::Running => 50,
            JobState::Done => 60,
            JobState::Aborted => 61,
            JobState::SchedulerError => 62,
            JobState::CompilerError => 63,
            JobState::WorkstationError => 64,
            JobState::PermissionDenied => 65,
            JobState::Error => 66,
            JobState::ArchivedDone => 90,
            JobState::ArchivedAborted => 91,
            JobState::ArchivedSchedulerError => 92,
            JobState::ArchivedCompilerError => 93,
            JobState::ArchivedWorkstationError => 94,
            JobState::ArchivedPermissionDenied => 95,
            JobState::ArchivedError => 96,
            JobState::Deleted => 100,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Prepared => "PREPARED",
            JobState::WaitingForWorkstation => "WAITING_FOR_WORKSTATION",
            JobState::Compiled => "COMPILED",
            JobState::Dispatched => "DISPATCHED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Aborted => "ABORTED",
            JobState::SchedulerError => "SCHEDULER_ERROR",
            JobState::CompilerError => "COMPILER_ERROR",
            JobState::WorkstationError => "WORKSTATION_ERROR",
            JobState::PermissionDenied => "PERMISSION_DENIED",
            JobState::Error => "ERROR",
            JobState::ArchivedDone => "ARCHIVED_DONE",
            JobState::ArchivedAborted => "ARCHIVED_ABORTED",
            JobState::ArchivedSchedulerError => "ARCHIVED_SCHEDULER_ERROR",
            JobState::ArchivedCompilerError => "ARCHIVED_COMPILER_ERROR",
            JobState::ArchivedWorkstationError => "ARCHIVED_WORKSTATION_ERROR",
            JobState::ArchivedPermissionDenied => "ARCHIVED_PERMISSION_DENIED",
            JobState::ArchivedError => "ARCHIVED_ERROR",
            JobState::Deleted => "DELETED",
        }
    }

    /// Execution has ended (successfully or not), including archived and deleted jobs.
    pub fn is_terminal(self) -> bool {
        self >= JobState::Done
    }

    pub fn is_archived(self) -> bool {
        (JobState::ArchivedDone..=JobState::ArchivedError).contains(&self)
    }

    /// The archived twin of a terminal state.
    pub fn archived(self) -> Option<Self> {
        match self {
            JobState::Done => Some(JobState::ArchivedDone),
            JobState::Aborted => Some(JobState::ArchivedAborted),
            JobState::SchedulerError => Some(JobState::ArchivedSchedulerError),
            JobState::CompilerError => Some(JobState::ArchivedCompilerError),
            JobState::WorkstationError => Some(JobState::ArchivedWorkstationError),
            JobState::PermissionDenied => Some(JobState::ArchivedPermissionDenied),
            JobState::Error => Some(JobState::ArchivedError),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
