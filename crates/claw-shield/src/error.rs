//! Error types for the shield core.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a packet-filter backend.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The filter command ran but reported failure.
    #[error("filter command `{command}` failed: {stderr}")]
    CommandFailed {
        /// The command line that was executed.
        command: String,
        /// Trimmed standard error of the command.
        stderr: String,
    },

    /// The filter backend could not be reached at all.
    #[error("filter backend unavailable: {0}")]
    Unavailable(String),

    /// The filter command did not finish in time.
    #[error("filter command timed out after {0:?}")]
    Timeout(Duration),

    /// The backend produced output that could not be understood.
    #[error("unparseable filter output: {0}")]
    Parse(String),

    /// Failure injected into the in-memory backend.
    #[error("injected filter failure: {0}")]
    Injected(String),
}

/// Result type for filter operations.
pub type FilterResult<T> = Result<T, FilterError>;

/// Errors that can occur in shield operations.
#[derive(Debug, Error)]
pub enum ShieldError {
    /// Persistent store error.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A stored row could not be mapped back to a record.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Packet-filter error.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for shield operations.
pub type ShieldResult<T> = Result<T, ShieldError>;
