//! claw-shieldd - adaptive intrusion prevention daemon.
//!
//! `run` follows the journal and enforces blocks; the other subcommands
//! inspect or adjust the shield state and exit.

use std::io;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use claw_shield::ShieldConfig;
use claw_shieldd::cli::{Cli, Commands};
use claw_shieldd::commands;
use claw_shieldd::daemon::{self, Services};
use claw_shieldd::logging::init_logging;
use claw_shieldd::output::OutputFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { output, force } = &cli.command {
        commands::init_config(output, *force)
            .with_context(|| format!("failed to write {}", output.display()))?;
        println!("Config written to {}", output.display());
        println!();
        println!("Review the allow-list and keywords, then run:");
        println!("  claw-shieldd --config {} run", output.display());
        return Ok(());
    }

    let config = ShieldConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    init_logging(&config.logging)?;

    if let Commands::Run = cli.command {
        info!(config = %cli.config.display(), "starting claw-shieldd");
        daemon::run(config).await?;
        return Ok(());
    }

    let services = Services::connect(config).await?;
    let result = commands::execute(
        &services,
        &cli.command,
        OutputFormat::new(cli.format),
        &mut io::stdout().lock(),
    )
    .await;
    services.close().await;
    result?;

    Ok(())
}
