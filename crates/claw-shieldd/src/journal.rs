//! systemd journal event source.
//!
//! Follows `journalctl -f -o json` and turns authentication failures into
//! [`AttemptEvent`]s. Entries that are not failures, or carry no usable
//! address, are dropped with a debug trace.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use claw_shield::{AttemptEvent, MonitoringConfig};
use regex::Regex;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{DaemonError, DaemonResult};

const JOURNALCTL: &str = "journalctl";
const IPV4_PATTERN: &str = r"\b(?:\d{1,3}\.){3}\d{1,3}\b";

/// Decides whether a log message is an authentication failure and extracts
/// its source address.
#[derive(Debug, Clone)]
pub struct FailureMatcher {
    keywords: Vec<String>,
    ipv4: Regex,
}

impl FailureMatcher {
    /// Create a matcher for `keywords`.
    pub fn new(keywords: Vec<String>) -> DaemonResult<Self> {
        let ipv4 = Regex::new(IPV4_PATTERN)
            .map_err(|e| DaemonError::Journal(format!("address pattern: {e}")))?;
        Ok(Self { keywords, ipv4 })
    }

    /// Whether `message` contains any configured keyword.
    #[must_use]
    pub fn is_failure(&self, message: &str) -> bool {
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }

    /// First IPv4 address in `message`, else the first IPv6 address.
    #[must_use]
    pub fn extract_address(&self, message: &str) -> Option<IpAddr> {
        let v4 = self
            .ipv4
            .find_iter(message)
            .find_map(|m| m.as_str().parse::<Ipv4Addr>().ok())
            .map(IpAddr::V4);

        v4.or_else(|| {
            message
                .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '"' | '\''))
                .map(|token| {
                    // "[addr]:port" form
                    token
                        .strip_prefix('[')
                        .and_then(|rest| rest.split(']').next())
                        .unwrap_or(token)
                        .trim_end_matches('.')
                })
                .filter(|token| token.contains(':'))
                .find_map(|token| token.parse::<Ipv6Addr>().ok())
                .map(IpAddr::V6)
        })
    }
}

/// Text of a `MESSAGE` field: a string, or an array of bytes for binary data.
fn message_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let bytes: Vec<u8> = items
                .iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<_>>()?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => None,
    }
}

/// Microsecond timestamp field, as a string (journal export) or a number.
fn timestamp_field(entry: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let micros = match entry.get(key)? {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    DateTime::from_timestamp_micros(micros)
}

/// Parse one journal JSON line into an attempt, if it is one.
#[must_use]
pub fn parse_entry(line: &str, matcher: &FailureMatcher) -> Option<AttemptEvent> {
    let entry: Map<String, Value> = match serde_json::from_str(line) {
        Ok(entry) => entry,
        Err(e) => {
            debug!(error = %e, "skipping malformed journal line");
            return None;
        }
    };

    let message = message_text(entry.get("MESSAGE")?)?;
    if !matcher.is_failure(&message) {
        return None;
    }
    let Some(address) = matcher.extract_address(&message) else {
        debug!(%message, "failure message without address");
        return None;
    };

    let occurred_at = timestamp_field(&entry, "_SOURCE_REALTIME_TIMESTAMP")
        .or_else(|| timestamp_field(&entry, "__REALTIME_TIMESTAMP"))
        .unwrap_or_else(Utc::now);

    Some(AttemptEvent::new(address, occurred_at, message))
}

/// Forward every attempt found on `reader` to `tx` until EOF, cancellation,
/// or the receiver going away. Returns the number of events forwarded.
pub async fn pump<R>(
    reader: R,
    matcher: &FailureMatcher,
    tx: &mpsc::Sender<AttemptEvent>,
    token: &CancellationToken,
) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    loop {
        let line = tokio::select! {
            () = token.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let Some(event) = parse_entry(&line, matcher) else {
                    trace!("journal entry ignored");
                    continue;
                };
                debug!(address = %event.address, "authentication failure observed");
                if tx.send(event).await.is_err() {
                    debug!("attempt receiver closed");
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {
                warn!("journal stream ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read journal stream");
                break;
            }
        }
    }

    forwarded
}

/// Follows the journal in a child process.
#[derive(Debug, Clone)]
pub struct JournalSource {
    program: String,
    identifiers: Vec<String>,
    matcher: FailureMatcher,
}

impl JournalSource {
    /// Create a source from the monitoring configuration.
    pub fn from_config(config: &MonitoringConfig) -> DaemonResult<Self> {
        Ok(Self {
            program: JOURNALCTL.to_string(),
            identifiers: config.syslog_identifiers.clone(),
            matcher: FailureMatcher::new(config.keywords.clone())?,
        })
    }

    /// Use a different executable in place of `journalctl`.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// The matcher applied to every entry.
    #[must_use]
    pub const fn matcher(&self) -> &FailureMatcher {
        &self.matcher
    }

    /// Arguments passed to the journal reader.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["--follow", "--output=json", "--lines=0", "--priority=info"]
            .iter()
            .map(ToString::to_string)
            .collect();
        args.extend(
            self.identifiers
                .iter()
                .map(|id| format!("SYSLOG_IDENTIFIER={id}")),
        );
        args
    }

    /// Start the reader and forward attempts to `tx` until `token` is cancelled.
    pub fn spawn(
        self,
        tx: mpsc::Sender<AttemptEvent>,
        token: CancellationToken,
    ) -> DaemonResult<JoinHandle<()>> {
        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::Journal(format!("{}: {e}", self.program)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::Journal("journal reader has no stdout".to_string()))?;

        info!(
            program = %self.program,
            identifiers = ?self.identifiers,
            "following journal"
        );

        Ok(tokio::spawn(async move {
            let forwarded = pump(BufReader::new(stdout), &self.matcher, &tx, &token).await;
            if let Err(e) = child.kill().await {
                debug!(error = %e, "journal reader already exited");
            }
            info!(forwarded, "journal source stopped");
        }))
    }
}
