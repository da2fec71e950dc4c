//! Error types shared by every datasync component.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while scheduling or running a sync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Bad local construction (caller bug). Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required executor, config record or schema is missing.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Sync is disabled for the requested scope.
    #[error("sync not opened for {0}")]
    Unopened(String),

    /// Connectivity precheck failed.
    #[error("network unavailable")]
    NetworkError,

    /// The target resource is locked by another party.
    #[error("resource locked")]
    ResourceLocked,

    /// Retry or watchdog budget exhausted.
    #[error("operation timed out")]
    Timeout,

    /// State, event or table lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// A timer fired that is no longer the armed one.
    #[error("unexpected timer {0}")]
    UnexpectedTimer(u64),

    /// The session is killed or otherwise unable to accept work.
    #[error("busy: {0}")]
    Busy(String),

    /// The session target queue is drained.
    #[error("no sync task left")]
    NoSyncTask,

    /// The timer service could not arm a timer.
    #[error("timer error: {0}")]
    Timer(String),

    /// A metadata record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A store-level failure reported by a collaborator.
    #[error("store error: {message}")]
    Store {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },
}

impl SyncError {
    /// Creates a retryable store error.
    pub fn store_retryable(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable store error.
    pub fn store_fatal(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error is retried locally.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store { retryable, .. } => *retryable,
            SyncError::InvalidArgument(_)
            | SyncError::Timeout
            | SyncError::NotFound(_)
            | SyncError::UnexpectedTimer(_) => false,
            _ => true,
        }
    }

    /// Returns true for lookup misses and stale timers, which callers drop.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, SyncError::NotFound(_) | SyncError::UnexpectedTimer(_))
    }
}
