//! Error types for skiff.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::RemoteError;

/// Main error type for skiff.
#[derive(Error, Debug)]
pub enum SkiffError {
    /// The worker process has exited; the handle is no longer usable.
    #[error("worker is terminated")]
    TerminatedWorker,

    /// The worker process could not be started or never completed the
    /// port handshake.
    #[error("{0}")]
    Spawn(String),

    /// The remote function raised; the error object is rethrown here.
    #[error("remote call failed: {0}")]
    Remote(RemoteError),

    /// A frame body could not be deserialized. The connection itself has
    /// been resynchronized to the next frame boundary and remains usable.
    #[error("payload could not be deserialized: {0}")]
    Serialization(String),

    /// The byte stream violated the framing contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `wait_for_exit` gave up; callers decide whether to escalate to `kill`.
    #[error("worker still running after {0:?}")]
    ExitTimeout(Duration),
}

impl SkiffError {
    /// True when a remote call was cancelled by an interrupt.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, SkiffError::Remote(e) if e.is_interrupt())
    }
}

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, SkiffError>;
