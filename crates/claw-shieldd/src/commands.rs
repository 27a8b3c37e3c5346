//! One-shot operator commands.
//!
//! Each command opens the store and the filter, acts through the
//! [`Dashboard`](claw_shield::Dashboard) and exits. A running daemon picks up
//! manual changes on its next sweep: new filter members are adopted from their
//! block records, and blocks lifted here are dropped from its view.

use std::io::Write;
use std::path::Path;

use claw_shield::ShieldConfig;
use tracing::warn;

use crate::cli::Commands;
use crate::daemon::Services;
use crate::error::{DaemonError, DaemonResult};
use crate::output::{ActionResult, HistoryView, OutputFormat, StatsView, StatusView};

/// Execute a dashboard command against `services`.
///
/// `run` and `init-config` are handled by the binary and rejected here.
pub async fn execute<W: Write>(
    services: &Services,
    command: &Commands,
    format: OutputFormat,
    writer: &mut W,
) -> DaemonResult<()> {
    let dashboard = services.dashboard();

    match command {
        Commands::Status { limit } => {
            let filter_members = match dashboard.filter_members().await {
                Ok(members) => Some(members),
                Err(e) => {
                    warn!(error = %e, "cannot read packet filter");
                    None
                }
            };
            let view = StatusView {
                backend: services.controller.filter().name().to_string(),
                active_blocks: dashboard.active_blocks().await?,
                filter_members,
                recent_attempts: dashboard.recent_attempts(*limit).await?,
            };
            format.write(writer, &view)
        }
        Commands::Block { address, minutes } => {
            let applied = dashboard.block(*address, *minutes).await;
            let result = ActionResult {
                action: "block".to_string(),
                address: *address,
                applied,
                minutes: Some(*minutes),
            };
            format.write(writer, &result)
        }
        Commands::Unblock { address } => {
            let applied = dashboard.unblock(*address).await;
            let result = ActionResult {
                action: "unblock".to_string(),
                address: *address,
                applied,
                minutes: None,
            };
            format.write(writer, &result)
        }
        Commands::History { address, limit } => {
            let view = HistoryView {
                blocks: dashboard.block_history(*address, *limit).await?,
            };
            format.write(writer, &view)
        }
        Commands::Stats => {
            let view = StatsView {
                stats: dashboard.stats().await?,
            };
            format.write(writer, &view)
        }
        Commands::Run | Commands::InitConfig { .. } => Err(DaemonError::Format(
            "not a dashboard command".to_string(),
        )),
    }
}

/// Write the sample configuration to `output`.
///
/// Refuses to overwrite an existing file unless `force` is set.
pub fn init_config(output: &Path, force: bool) -> DaemonResult<()> {
    if output.exists() && !force {
        return Err(DaemonError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists (use --force to overwrite)", output.display()),
        )));
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let content = ShieldConfig::sample().to_toml()?;
    std::fs::write(output, content)?;
    Ok(())
}
