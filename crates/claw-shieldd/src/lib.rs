//! # claw-shieldd
//!
//! Daemon and operator CLI for [`claw_shield`].
//!
//! - [`journal`] - Follows the systemd journal and emits attempts
//! - [`daemon`] - Bootstrap, ingestion worker, expiry sweep and shutdown
//! - [`commands`] - One-shot dashboard commands (`status`, `block`, `history`, ...)
//! - [`logging`] - Tracing subscriber setup

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod daemon;
pub mod error;
pub mod journal;
pub mod logging;
pub mod output;

pub use daemon::{RunningDaemon, Services};
pub use error::{DaemonError, DaemonResult};
pub use journal::{FailureMatcher, JournalSource};
