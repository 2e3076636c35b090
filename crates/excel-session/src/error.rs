//! Error types for excel-session

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::host::HostError;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the instance pool and the session layer.
///
/// Each variant carries what a caller needs to decide between retrying later,
/// fixing its input and asking a human.
#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("File already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Generated session id {0} is already in use")]
    SessionIdCollision(String),

    /// The file's pooled instance is leased by an open session.
    #[error("'{}' is already open in another session; close that session first", .path.display())]
    SessionActive { path: PathBuf },

    #[error(
        "Excel instance limit reached ({live}/{max} instances in use). \
         Idle instances are released after {} seconds; retry later or close an open session.",
        .idle_timeout.as_secs()
    )]
    CapacityExceeded {
        live: usize,
        max: usize,
        idle_timeout: Duration,
    },

    #[error(
        "Excel is busy and rejected the request for '{}'. \
         Close any open dialog or finish cell editing in Excel, then retry.",
        .path.display()
    )]
    HostBusy { path: PathBuf },

    #[error(
        "'{}' is locked by another process. Close it in Excel or any other application, then retry.",
        .path.display()
    )]
    FileLocked { path: PathBuf },

    #[error("Excel instance for '{}' stopped responding and could not be recovered: {source}", .path.display())]
    HandleInvalidated {
        path: PathBuf,
        #[source]
        source: HostError,
    },

    #[error("Failed to start Excel: {0}")]
    Launch(#[source] HostError),

    #[error("Failed to open '{}': {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: HostError,
    },

    #[error("Failed to save '{}': {source}", .path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: HostError,
    },

    #[error("Failed to close '{}': {source}", .path.display())]
    Close {
        path: PathBuf,
        #[source]
        source: HostError,
    },

    /// The caller's work function failed; the host error is passed through.
    #[error(transparent)]
    Work(HostError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Excel instance for '{}' was retired; reopen the file", .0.display())]
    InstanceRetired(PathBuf),

    #[error("Instance pool is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),
}

impl Error {
    /// Whether retrying the same request later can succeed without any change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. }
                | Error::HostBusy { .. }
                | Error::FileLocked { .. }
                | Error::Timeout(_)
        )
    }
}
