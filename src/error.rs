use std::path::PathBuf;

/// Failure of a single collection for one poll cycle.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    /// The kernel counters could not be read.
    #[error("kernel API unavailable: {0}")]
    KernelUnavailable(String),

    #[error("collection timed out")]
    Timeout,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// The blocking worker running the collection panicked or was cancelled.
    #[error("collection worker failed: {0}")]
    Join(String),
}

/// Failure of a user-requested process termination.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminateError {
    #[error("process {0} not found")]
    NotFound(u32),

    #[error("insufficient permissions to terminate process {0}")]
    InsufficientPermissions(u32),

    #[error("process {0} is system-critical")]
    SystemCritical(u32),

    #[error("failed to terminate process {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Parse(String),
}

impl From<ini::Error> for SettingsError {
    fn from(e: ini::Error) -> Self {
        match e {
            ini::Error::Io(e) => Self::Io(e),
            ini::Error::Parse(e) => Self::Parse(e.to_string()),
        }
    }
}

pub type Result<T, E = CollectError> = std::result::Result<T, E>;
