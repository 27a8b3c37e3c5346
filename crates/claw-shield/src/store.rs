//! Durable record of attempts and blocks.
//!
//! Backed by `SQLite` through `sqlx`. The store is the source of truth across
//! restarts: attempt counting, offense history and active blocks are all
//! answered from here. The "one active block per address" invariant is
//! enforced by a partial unique index and by superseding the previous active
//! record in the same transaction that inserts a new one.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::{debug, info};

use crate::error::{ShieldError, ShieldResult};
use crate::types::{AttemptEvent, AttemptRecord, BlockRecord, BlockStats};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL,
        occurred_at INTEGER NOT NULL,
        detail TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_attempts_address_time ON attempts(address, occurred_at)",
    "CREATE TABLE IF NOT EXISTS blocks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        offense_count INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        cleared_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_blocks_address ON blocks(address)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_expires ON blocks(expires_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blocks_one_active ON blocks(address) WHERE active = 1",
];

const BLOCK_COLUMNS: &str =
    "id, address, reason, created_at, expires_at, offense_count, active, cleared_at";

/// Number of entries in the "top" lists of [`BlockStats`].
const TOP_LIMIT: i64 = 10;

/// `SQLite`-backed persistent store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> ShieldResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema cannot be created.
    pub async fn open_in_memory() -> ShieldResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection that never recycles: each connection would
        // otherwise see its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> ShieldResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("store schema ready");
        Ok(())
    }

    /// Close the underlying pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Whether [`SqliteStore::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    #[cfg(test)]
    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== Attempts ====================

    /// Persist an attempt.
    pub async fn log_attempt(&self, event: &AttemptEvent) -> ShieldResult<AttemptRecord> {
        let result =
            sqlx::query("INSERT INTO attempts (address, occurred_at, detail) VALUES (?1, ?2, ?3)")
                .bind(event.address.to_string())
                .bind(event.occurred_at.timestamp_millis())
                .bind(&event.detail)
                .execute(&self.pool)
                .await?;

        Ok(AttemptRecord {
            id: result.last_insert_rowid(),
            address: event.address,
            occurred_at: event.occurred_at,
            detail: event.detail.clone(),
        })
    }

    /// Count attempts from `address` with `since <= occurred_at <= until`.
    pub async fn count_attempts(
        &self,
        address: IpAddr,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> ShieldResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attempts WHERE address = ?1 AND occurred_at >= ?2 AND occurred_at <= ?3",
        )
        .bind(address.to_string())
        .bind(since.timestamp_millis())
        .bind(until.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Most recent attempts across all addresses, newest first.
    pub async fn recent_attempts(&self, limit: u32) -> ShieldResult<Vec<AttemptRecord>> {
        let rows = sqlx::query(
            "SELECT id, address, occurred_at, detail FROM attempts ORDER BY occurred_at DESC, id DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    /// Most recent attempts from one address, newest first.
    pub async fn attempts_for(
        &self,
        address: IpAddr,
        limit: u32,
    ) -> ShieldResult<Vec<AttemptRecord>> {
        let rows = sqlx::query(
            "SELECT id, address, occurred_at, detail FROM attempts WHERE address = ?1 ORDER BY occurred_at DESC, id DESC LIMIT ?2",
        )
        .bind(address.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    // ==================== Blocks ====================

    /// Persist a new active block, superseding any active block for the address.
    ///
    /// The offense count is one more than the highest count ever recorded for
    /// the address.
    pub async fn log_block(
        &self,
        address: IpAddr,
        reason: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> ShieldResult<BlockRecord> {
        let address_text = address.to_string();
        let created_ms = created_at.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before reading.
        let superseded = sqlx::query(
            "UPDATE blocks SET active = 0, cleared_at = ?2 WHERE address = ?1 AND active = 1",
        )
        .bind(&address_text)
        .bind(created_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let previous: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(offense_count), 0) FROM blocks WHERE address = ?1",
        )
        .bind(&address_text)
        .fetch_one(&mut *tx)
        .await?;
        let offense_count = previous.saturating_add(1);

        let result = sqlx::query(
            "INSERT INTO blocks (address, reason, created_at, expires_at, offense_count, active) VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        )
        .bind(&address_text)
        .bind(reason)
        .bind(created_ms)
        .bind(expires_at.timestamp_millis())
        .bind(offense_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if superseded > 0 {
            debug!(address = %address, superseded, "previous active block superseded");
        }

        Ok(BlockRecord {
            id: result.last_insert_rowid(),
            address,
            reason: reason.to_string(),
            created_at: from_millis(created_ms)?,
            expires_at: from_millis(expires_at.timestamp_millis())?,
            offense_count: u32::try_from(offense_count).unwrap_or(u32::MAX),
            active: true,
            cleared_at: None,
        })
    }

    /// Number of blocks ever issued against `address`.
    pub async fn offense_count(&self, address: IpAddr) -> ShieldResult<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE address = ?1")
            .bind(address.to_string())
            .fetch_one(&self.pool)
            .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// The active block for `address`, if any.
    pub async fn active_block(&self, address: IpAddr) -> ShieldResult<Option<BlockRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE address = ?1 AND active = 1"
        ))
        .bind(address.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(block_from_row).transpose()
    }

    /// All active blocks, soonest expiry first.
    pub async fn active_blocks(&self) -> ShieldResult<Vec<BlockRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE active = 1 ORDER BY expires_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(block_from_row).collect()
    }

    /// Active blocks whose expiry is at or before `now`.
    pub async fn expired_active_blocks(&self, now: DateTime<Utc>) -> ShieldResult<Vec<BlockRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE active = 1 AND expires_at <= ?1 ORDER BY expires_at ASC"
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(block_from_row).collect()
    }

    /// Clear the active block for `address`. Returns whether a record changed.
    pub async fn deactivate(&self, address: IpAddr, at: DateTime<Utc>) -> ShieldResult<bool> {
        let affected = sqlx::query(
            "UPDATE blocks SET active = 0, cleared_at = ?2 WHERE address = ?1 AND active = 1",
        )
        .bind(address.to_string())
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Clear one block record by id. Returns whether the record changed.
    pub async fn deactivate_record(&self, id: i64, at: DateTime<Utc>) -> ShieldResult<bool> {
        let affected =
            sqlx::query("UPDATE blocks SET active = 0, cleared_at = ?2 WHERE id = ?1 AND active = 1")
                .bind(id)
                .bind(at.timestamp_millis())
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(affected > 0)
    }

    /// Block history, newest first, optionally for one address.
    pub async fn block_history(
        &self,
        address: Option<IpAddr>,
        limit: u32,
    ) -> ShieldResult<Vec<BlockRecord>> {
        let rows = match address {
            Some(address) => {
                sqlx::query(&format!(
                    "SELECT {BLOCK_COLUMNS} FROM blocks WHERE address = ?1 ORDER BY id DESC LIMIT ?2"
                ))
                .bind(address.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY id DESC LIMIT ?1"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(block_from_row).collect()
    }

    /// Aggregate statistics over the whole history.
    pub async fn stats(&self) -> ShieldResult<BlockStats> {
        let total_blocks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        let active_blocks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE active = 1")
            .fetch_one(&self.pool)
            .await?;
        let unique_addresses: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT address) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        let total_attempts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attempts")
            .fetch_one(&self.pool)
            .await?;

        let top_addresses = sqlx::query(
            "SELECT address, COUNT(*) AS n FROM blocks GROUP BY address ORDER BY n DESC, address ASC LIMIT ?1",
        )
        .bind(TOP_LIMIT)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> ShieldResult<(IpAddr, u64)> {
            let address: String = row.try_get("address")?;
            let n: i64 = row.try_get("n")?;
            Ok((parse_address(&address)?, to_u64(n)))
        })
        .collect::<ShieldResult<Vec<_>>>()?;

        let top_reasons = sqlx::query(
            "SELECT reason, COUNT(*) AS n FROM blocks GROUP BY reason ORDER BY n DESC, reason ASC LIMIT ?1",
        )
        .bind(TOP_LIMIT)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> ShieldResult<(String, u64)> {
            let reason: String = row.try_get("reason")?;
            let n: i64 = row.try_get("n")?;
            Ok((reason, to_u64(n)))
        })
        .collect::<ShieldResult<Vec<_>>>()?;

        Ok(BlockStats {
            total_blocks: to_u64(total_blocks),
            active_blocks: to_u64(active_blocks),
            unique_addresses: to_u64(unique_addresses),
            total_attempts: to_u64(total_attempts),
            top_addresses,
            top_reasons,
        })
    }
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_address(text: &str) -> ShieldResult<IpAddr> {
    text.parse()
        .map_err(|_| ShieldError::InvalidAddress(text.to_string()))
}

fn from_millis(ms: i64) -> ShieldResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ShieldError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn attempt_from_row(row: &SqliteRow) -> ShieldResult<AttemptRecord> {
    let address: String = row.try_get("address")?;
    Ok(AttemptRecord {
        id: row.try_get("id")?,
        address: parse_address(&address)?,
        occurred_at: from_millis(row.try_get("occurred_at")?)?,
        detail: row.try_get("detail")?,
    })
}

fn block_from_row(row: &SqliteRow) -> ShieldResult<BlockRecord> {
    let address: String = row.try_get("address")?;
    let offense_count: i64 = row.try_get("offense_count")?;
    let active: i64 = row.try_get("active")?;
    let cleared_at: Option<i64> = row.try_get("cleared_at")?;

    Ok(BlockRecord {
        id: row.try_get("id")?,
        address: parse_address(&address)?,
        reason: row.try_get("reason")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        expires_at: from_millis(row.try_get("expires_at")?)?,
        offense_count: u32::try_from(offense_count)
            .map_err(|_| ShieldError::Corrupt(format!("offense count {offense_count}")))?,
        active: active != 0,
        cleared_at: cleared_at.map(from_millis).transpose()?,
    })
}
