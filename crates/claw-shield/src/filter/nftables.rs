//! nftables packet filter driven through the `nft` command.
//!
//! Layout (family `inet`):
//!
//! ```text
//! table inet <table> {
//!     set blocklist_v4 { type ipv4_addr; }
//!     set blocklist_v6 { type ipv6_addr; }
//!     chain input {
//!         type filter hook input priority 0; policy accept;
//!         ip saddr @blocklist_v4 counter drop
//!         ip6 saddr @blocklist_v6 counter drop
//!     }
//! }
//! ```

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::PacketFilter;
use crate::error::{FilterError, FilterResult};

const NFT: &str = "nft";
const SET_V4: &str = "blocklist_v4";
const SET_V6: &str = "blocklist_v6";
const CHAIN: &str = "input";

/// Set name holding addresses of the given family.
const fn set_for(address: IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => SET_V4,
        IpAddr::V6(_) => SET_V6,
    }
}

/// Arguments addressing one element: `inet <table> <set> { <addr> }`.
#[must_use]
pub(crate) fn element_args(table: &str, address: IpAddr) -> Vec<String> {
    vec![
        "inet".to_string(),
        table.to_string(),
        set_for(address).to_string(),
        "{".to_string(),
        address.to_string(),
        "}".to_string(),
    ]
}

/// Extract the addresses of an `nft -j list set` document.
///
/// Plain elements and `{"elem": {"val": ...}}` wrappers (sets with timeouts or
/// counters) are understood; prefixes and ranges are skipped.
pub fn parse_set_elements(json: &str) -> FilterResult<BTreeSet<IpAddr>> {
    let document: Value =
        serde_json::from_str(json).map_err(|e| FilterError::Parse(format!("nft json: {e}")))?;
    let objects = document
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| FilterError::Parse("missing `nftables` array".to_string()))?;

    let mut members = BTreeSet::new();
    for set in objects.iter().filter_map(|o| o.get("set")) {
        let Some(elements) = set.get("elem").and_then(Value::as_array) else {
            continue;
        };
        for element in elements {
            let text = element.as_str().or_else(|| {
                element
                    .get("elem")
                    .and_then(|e| e.get("val"))
                    .and_then(Value::as_str)
            });
            match text.map(str::parse::<IpAddr>) {
                Some(Ok(address)) => {
                    members.insert(address);
                }
                _ => debug!(element = %element, "skipping non-address set element"),
            }
        }
    }
    Ok(members)
}

/// Packet filter backed by an nftables table.
#[derive(Debug, Clone)]
pub struct NftablesFilter {
    table: String,
    command_timeout: Duration,
}

impl NftablesFilter {
    /// Create a filter over `table`. Call [`NftablesFilter::setup`] before use.
    #[must_use]
    pub fn new(table: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            table: table.into(),
            command_timeout,
        }
    }

    /// Table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table, sets, chain and drop rules if they are missing.
    pub async fn setup(&self) -> FilterResult<()> {
        let table = self.table.as_str();
        self.run(&["add", "table", "inet", table]).await?;
        self.run(&[
            "add", "set", "inet", table, SET_V4, "{", "type", "ipv4_addr", ";", "}",
        ])
        .await?;
        self.run(&[
            "add", "set", "inet", table, SET_V6, "{", "type", "ipv6_addr", ";", "}",
        ])
        .await?;
        self.run(&[
            "add", "chain", "inet", table, CHAIN, "{", "type", "filter", "hook", "input",
            "priority", "0", ";", "policy", "accept", ";", "}",
        ])
        .await?;

        // `add rule` is not idempotent: only append drop rules that are absent.
        let chain = self.run(&["list", "chain", "inet", table, CHAIN]).await?;
        for (family, set) in [("ip", SET_V4), ("ip6", SET_V6)] {
            let reference = format!("@{set}");
            if chain.contains(&reference) {
                continue;
            }
            self.run(&[
                "add",
                "rule",
                "inet",
                table,
                CHAIN,
                family,
                "saddr",
                reference.as_str(),
                "counter",
                "drop",
            ])
            .await?;
            info!(table, set, "installed drop rule");
        }
        Ok(())
    }

    /// Run `nft` with `args`, returning stdout on success.
    async fn run<S: AsRef<str>>(&self, args: &[S]) -> FilterResult<String> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let command = format!("{NFT} {}", args.join(" "));

        let child = Command::new(NFT)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| {
                warn!(%command, "filter command timed out");
                FilterError::Timeout(self.command_timeout)
            })?
            .map_err(|e| FilterError::Unavailable(format!("{NFT}: {e}")))?;

        if !output.status.success() {
            return Err(FilterError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(%command, "filter command ok");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PacketFilter for NftablesFilter {
    async fn add(&self, address: IpAddr) -> FilterResult<()> {
        let mut args = vec!["add".to_string(), "element".to_string()];
        args.extend(element_args(&self.table, address));
        self.run(&args).await?;
        Ok(())
    }

    async fn remove(&self, address: IpAddr) -> FilterResult<()> {
        // `delete element` fails for non-members; check first to stay idempotent.
        if !self.contains(address).await? {
            return Ok(());
        }
        let mut args = vec!["delete".to_string(), "element".to_string()];
        args.extend(element_args(&self.table, address));
        self.run(&args).await?;
        Ok(())
    }

    async fn contains(&self, address: IpAddr) -> FilterResult<bool> {
        let mut args = vec!["get".to_string(), "element".to_string()];
        args.extend(element_args(&self.table, address));
        match self.run(&args).await {
            Ok(_) => Ok(true),
            Err(FilterError::CommandFailed { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> FilterResult<BTreeSet<IpAddr>> {
        let mut members = BTreeSet::new();
        for set in [SET_V4, SET_V6] {
            let json = self
                .run(&["-j", "list", "set", "inet", self.table.as_str(), set])
                .await?;
            members.extend(parse_set_elements(&json)?);
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().expect("valid address")
    }

    #[test]
    fn test_element_args_pick_set_by_family() {
        assert_eq!(
            element_args("claw_shield", addr("10.0.0.5")),
            ["inet", "claw_shield", "blocklist_v4", "{", "10.0.0.5", "}"]
        );
        assert_eq!(
            element_args("claw_shield", addr("2001:db8::1"))[2],
            "blocklist_v6"
        );
    }

    #[test]
    fn test_parse_plain_elements() {
        let json = r#"{"nftables": [
            {"metainfo": {"version": "1.0.6", "json_schema_version": 1}},
            {"set": {"family": "inet", "name": "blocklist_v4", "table": "claw_shield",
                     "type": "ipv4_addr", "handle": 2,
                     "elem": ["10.0.0.5", "192.168.1.9"]}}
        ]}"#;

        let members = parse_set_elements(json).expect("parse");
        assert_eq!(members.len(), 2);
        assert!(members.contains(&addr("10.0.0.5")));
        assert!(members.contains(&addr("192.168.1.9")));
    }

    #[test]
    fn test_parse_wrapped_and_prefix_elements() {
        let json = r#"{"nftables": [
            {"set": {"family": "inet", "name": "blocklist_v6", "table": "claw_shield",
                     "type": "ipv6_addr", "handle": 3,
                     "elem": [
                        {"elem": {"val": "2001:db8::7", "counter": {"packets": 0, "bytes": 0}}},
                        {"prefix": {"addr": "2001:db8:1::", "len": 48}}
                     ]}}
        ]}"#;

        let members = parse_set_elements(json).expect("parse");
        assert_eq!(members.into_iter().collect::<Vec<_>>(), [addr("2001:db8::7")]);
    }

    #[test]
    fn test_parse_empty_set() {
        let json = r#"{"nftables": [{"set": {"name": "blocklist_v4", "type": "ipv4_addr"}}]}"#;
        assert!(parse_set_elements(json).expect("parse").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_set_elements("not json"),
            Err(FilterError::Parse(_))
        ));
        assert!(matches!(
            parse_set_elements(r#"{"other": []}"#),
            Err(FilterError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable_or_fails() {
        // Either nft is absent (Unavailable), or present without privileges
        // or without the table (CommandFailed). It never silently succeeds.
        let filter = NftablesFilter::new("claw_shield_test_absent", Duration::from_secs(2));
        assert!(filter.list().await.is_err());
    }
}
