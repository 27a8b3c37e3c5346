//! Error types for the daemon.

use thiserror::Error;

/// Errors raised while bootstrapping or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Error from the shield core.
    #[error(transparent)]
    Shield(#[from] claw_shield::ShieldError),

    /// The journal reader could not be started or died.
    #[error("journal source error: {0}")]
    Journal(String),

    /// The tracing subscriber could not be installed.
    #[error("logging setup failed: {0}")]
    Logging(String),

    /// Output could not be rendered.
    #[error("format error: {0}")]
    Format(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
