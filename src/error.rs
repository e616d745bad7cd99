use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: ignore::Error,
    },

    #[error("Failed to archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol(message.into())
    }

    /// Transport failures end the session; everything else is reported to
    /// the peer as a failed call.
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
