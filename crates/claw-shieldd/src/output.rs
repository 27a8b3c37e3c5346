//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::collections::BTreeSet;
use std::io::Write;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use claw_shield::{AttemptRecord, BlockRecord, BlockStats};
use serde::Serialize;

use crate::cli::Format;
use crate::error::{DaemonError, DaemonResult};

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a value in the selected format.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> DaemonResult<()>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| DaemonError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer)?,
        }
        Ok(())
    }

    /// Render a value to a string.
    pub fn to_string<T>(&self, value: &T) -> DaemonResult<String>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| DaemonError::Format(format!("UTF-8 error: {e}")))
    }
}

/// Types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    fn write_table<W: Write>(&self, writer: &mut W) -> DaemonResult<()>;
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

fn write_blocks<W: Write>(writer: &mut W, blocks: &[BlockRecord]) -> DaemonResult<()> {
    writeln!(
        writer,
        "{:<39}  {:<14}  {:>7}  {:<19}  {:<19}  {:<8}",
        "ADDRESS", "REASON", "OFFENSE", "CREATED", "EXPIRES", "STATE"
    )?;
    writeln!(writer, "{}", "─".repeat(116))?;
    for block in blocks {
        writeln!(
            writer,
            "{:<39}  {:<14}  {:>7}  {:<19}  {:<19}  {:<8}",
            block.address,
            truncate(&block.reason, 14),
            block.offense_count,
            timestamp(block.created_at),
            timestamp(block.expires_at),
            if block.active { "active" } else { "cleared" }
        )?;
    }
    Ok(())
}

/// Snapshot shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    /// Filter backend name.
    pub backend: String,
    /// Active block records.
    pub active_blocks: Vec<BlockRecord>,
    /// Addresses in the packet filter (None if the filter could not be read).
    pub filter_members: Option<BTreeSet<IpAddr>>,
    /// Most recent attempts.
    pub recent_attempts: Vec<AttemptRecord>,
}

impl TableDisplay for StatusView {
    fn write_table<W: Write>(&self, writer: &mut W) -> DaemonResult<()> {
        writeln!(writer, "Shield Status")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Filter backend:   {}", self.backend)?;
        match &self.filter_members {
            Some(members) => writeln!(writer, "Filter members:   {}", members.len())?,
            None => writeln!(writer, "Filter members:   unavailable")?,
        }
        writeln!(writer, "Active blocks:    {}", self.active_blocks.len())?;
        writeln!(writer)?;

        if !self.active_blocks.is_empty() {
            write_blocks(writer, &self.active_blocks)?;
            writeln!(writer)?;
        }

        if self.recent_attempts.is_empty() {
            writeln!(writer, "No recent attempts")?;
            return Ok(());
        }
        writeln!(writer, "Recent attempts")?;
        writeln!(writer, "{:<19}  {:<39}  DETAIL", "TIME", "ADDRESS")?;
        writeln!(writer, "{}", "─".repeat(100))?;
        for attempt in &self.recent_attempts {
            writeln!(
                writer,
                "{:<19}  {:<39}  {}",
                timestamp(attempt.occurred_at),
                attempt.address,
                truncate(&attempt.detail, 60)
            )?;
        }
        Ok(())
    }
}

/// Block history shown by `history`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    /// Blocks, newest first.
    pub blocks: Vec<BlockRecord>,
}

impl TableDisplay for HistoryView {
    fn write_table<W: Write>(&self, writer: &mut W) -> DaemonResult<()> {
        if self.blocks.is_empty() {
            writeln!(writer, "No blocks recorded")?;
            return Ok(());
        }
        write_blocks(writer, &self.blocks)?;
        writeln!(writer)?;
        writeln!(writer, "Total: {} block(s)", self.blocks.len())?;
        Ok(())
    }
}

/// Statistics shown by `stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsView {
    /// Aggregates from the store.
    #[serde(flatten)]
    pub stats: BlockStats,
}

impl TableDisplay for StatsView {
    fn write_table<W: Write>(&self, writer: &mut W) -> DaemonResult<()> {
        let stats = &self.stats;
        writeln!(writer, "Shield Statistics")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Total blocks:     {}", stats.total_blocks)?;
        writeln!(writer, "Active blocks:    {}", stats.active_blocks)?;
        writeln!(writer, "Unique addresses: {}", stats.unique_addresses)?;
        writeln!(writer, "Total attempts:   {}", stats.total_attempts)?;

        if !stats.top_addresses.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "Most blocked addresses")?;
            for (address, count) in &stats.top_addresses {
                writeln!(writer, "  {address:<39}  {count:>6}")?;
            }
        }
        if !stats.top_reasons.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "Top reasons")?;
            for (reason, count) in &stats.top_reasons {
                writeln!(writer, "  {reason:<39}  {count:>6}")?;
            }
        }
        Ok(())
    }
}

/// Result of a manual block or unblock.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    /// `block` or `unblock`.
    pub action: String,
    /// Target address.
    pub address: IpAddr,
    /// Whether the action took effect.
    pub applied: bool,
    /// Block length in minutes, for blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u64>,
}

impl TableDisplay for ActionResult {
    fn write_table<W: Write>(&self, writer: &mut W) -> DaemonResult<()> {
        match (self.action.as_str(), self.applied, self.minutes) {
            ("block", true, Some(minutes)) => {
                writeln!(writer, "Blocked {} for {minutes} minute(s)", self.address)?;
            }
            ("block", false, _) => writeln!(
                writer,
                "Could not block {} (allow-listed or enforcement failed; see logs)",
                self.address
            )?,
            ("unblock", true, _) => writeln!(writer, "Unblocked {}", self.address)?,
            ("unblock", false, _) => writeln!(writer, "{} was not blocked", self.address)?,
            _ => writeln!(
                writer,
                "{} {}: {}",
                self.action,
                self.address,
                if self.applied { "ok" } else { "failed" }
            )?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(active: bool) -> BlockRecord {
        let now = Utc::now();
        BlockRecord {
            id: 1,
            address: "10.0.0.5".parse().expect("valid address"),
            reason: "auth-failure".into(),
            created_at: now,
            expires_at: now + chrono::TimeDelta::minutes(10),
            offense_count: 2,
            active,
            cleared_at: None,
        }
    }

    #[test]
    fn test_history_table() {
        let view = HistoryView {
            blocks: vec![block(true), block(false)],
        };
        let out = OutputFormat::new(Format::Table).to_string(&view).expect("render");
        assert!(out.contains("ADDRESS"));
        assert!(out.contains("10.0.0.5"));
        assert!(out.contains("cleared"));
        assert!(out.contains("Total: 2 block(s)"));
    }

    #[test]
    fn test_empty_history_table() {
        let view = HistoryView { blocks: vec![] };
        let out = OutputFormat::new(Format::Table).to_string(&view).expect("render");
        assert_eq!(out.trim(), "No blocks recorded");
    }

    #[test]
    fn test_history_json() {
        let view = HistoryView {
            blocks: vec![block(true)],
        };
        let format = OutputFormat::new(Format::Json);
        assert!(format.is_json());

        let out = format.to_string(&view).expect("render");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value["blocks"][0]["address"], "10.0.0.5");
        assert_eq!(value["blocks"][0]["offense_count"], 2);
    }

    #[test]
    fn test_stats_json_is_flat() {
        let view = StatsView {
            stats: BlockStats {
                total_blocks: 3,
                ..BlockStats::default()
            },
        };
        let out = OutputFormat::new(Format::Json).to_string(&view).expect("render");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value["total_blocks"], 3);
    }

    #[test]
    fn test_status_table_with_unavailable_filter() {
        let view = StatusView {
            backend: "nftables".into(),
            active_blocks: vec![block(true)],
            filter_members: None,
            recent_attempts: vec![],
        };
        let out = OutputFormat::new(Format::Table).to_string(&view).expect("render");
        assert!(out.contains("unavailable"));
        assert!(out.contains("No recent attempts"));
    }

    #[test]
    fn test_action_messages() {
        let format = OutputFormat::new(Format::Table);
        let address: IpAddr = "10.0.0.5".parse().expect("valid address");

        let blocked = ActionResult {
            action: "block".into(),
            address,
            applied: true,
            minutes: Some(60),
        };
        assert_eq!(
            format.to_string(&blocked).expect("render").trim(),
            "Blocked 10.0.0.5 for 60 minute(s)"
        );

        let not_blocked = ActionResult {
            action: "unblock".into(),
            address,
            applied: false,
            minutes: None,
        };
        assert_eq!(
            format.to_string(&not_blocked).expect("render").trim(),
            "10.0.0.5 was not blocked"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
