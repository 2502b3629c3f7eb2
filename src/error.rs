use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
