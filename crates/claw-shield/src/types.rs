//! Records exchanged between the event source, the store and the dashboard.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A single authentication failure reported by the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptEvent {
    /// Source address of the attempt.
    pub address: IpAddr,
    /// When the attempt happened, as reported by the source.
    pub occurred_at: DateTime<Utc>,
    /// Free-form detail (usually the raw log message).
    pub detail: String,
}

impl AttemptEvent {
    /// Create a new attempt event.
    #[must_use]
    pub fn new(address: IpAddr, occurred_at: DateTime<Utc>, detail: impl Into<String>) -> Self {
        Self {
            address,
            occurred_at,
            detail: detail.into(),
        }
    }
}

/// A persisted attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Auto-incremented row id.
    pub id: i64,
    /// Source address of the attempt.
    pub address: IpAddr,
    /// When the attempt happened.
    pub occurred_at: DateTime<Utc>,
    /// Free-form detail.
    pub detail: String,
}

/// A persisted block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Auto-incremented row id.
    pub id: i64,
    /// Blocked address.
    pub address: IpAddr,
    /// Name of the rule (or `manual`) that issued the block.
    pub reason: String,
    /// When the block was issued.
    pub created_at: DateTime<Utc>,
    /// When the block lapses.
    pub expires_at: DateTime<Utc>,
    /// 1-based number of blocks ever issued against this address.
    pub offense_count: u32,
    /// Whether the block is still in force.
    pub active: bool,
    /// When the block was cleared (None while active).
    pub cleared_at: Option<DateTime<Utc>>,
}

impl BlockRecord {
    /// Check whether the block has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Length of the block as issued.
    #[must_use]
    pub fn duration(&self) -> Duration {
        (self.expires_at - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Aggregate statistics for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Blocks ever issued.
    pub total_blocks: u64,
    /// Blocks currently active.
    pub active_blocks: u64,
    /// Distinct addresses ever blocked.
    pub unique_addresses: u64,
    /// Attempts ever recorded.
    pub total_attempts: u64,
    /// Most frequently blocked addresses, descending.
    pub top_addresses: Vec<(IpAddr, u64)>,
    /// Most frequent block reasons, descending.
    pub top_reasons: Vec<(String, u64)>,
}

/// Add a std duration to a timestamp, saturating at the largest representable instant.
#[must_use]
pub fn expiry_after(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
