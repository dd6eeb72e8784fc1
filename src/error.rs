//! Error types for forkpool.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;

use crate::wire::WireError;
use crate::worker::ChannelError;

/// Main error type for forkpool.
///
/// Everything here is a parent-side failure that stops a run. Failures inside
/// a child never surface as a `PoolError`; they are recorded in that unit's
/// result envelope instead.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to derive IPC key from {path}: {source}")]
    KeyDerivation { path: String, source: Errno },

    #[error("Failed to set up {resource}: {source}")]
    Setup {
        resource: &'static str,
        source: Errno,
    },

    #[error("Semaphore {op} failed: {source}")]
    Semaphore { op: &'static str, source: Errno },

    #[error("Could not fork process: {0}")]
    Fork(Errno),

    #[error("waitpid failed for child {pid}: {source}")]
    Wait { pid: Pid, source: Errno },

    #[error("No report from child {pid} after {attempts} attempts: {reason}")]
    ReportLost {
        pid: Pid,
        attempts: u32,
        reason: String,
    },

    #[error("Malformed report from child {pid}: {reason}")]
    MalformedReport { pid: Pid, reason: String },

    #[error("{field} is write-once and was already set")]
    AlreadyBound { field: &'static str },

    #[error("Pool IPC resources are not set up")]
    NotSetUp,

    #[error("Interrupted by {0}")]
    Interrupted(Signal),

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(Errno),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// The OS error code behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            PoolError::KeyDerivation { source, .. }
            | PoolError::Setup { source, .. }
            | PoolError::Semaphore { source, .. }
            | PoolError::Wait { source, .. } => Some(*source),
            PoolError::Fork(errno) | PoolError::SignalHandler(errno) => Some(*errno),
            PoolError::Channel(err) => err.code().map(Errno::from_raw),
            _ => None,
        }
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
