use anyhow::{Context, Result};
use clap::Parser;
use gps2bq_config::RuntimeConfig;
use std::path::PathBuf;

/// Location-telemetry ingestion pipeline: Redis → object store → warehouse
#[derive(Parser)]
#[command(name = "gps2bq")]
#[command(version)]
#[command(about = "Location-telemetry ingestion pipeline: Redis -> object store -> warehouse", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Pipeline phase: legacy, hybrid, migration, new
    #[arg(short, long, value_name = "PHASE")]
    phase: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load().context("Failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli)?;
    config.validate().context("Invalid configuration")?;

    gps2bq_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) -> Result<()> {
    use gps2bq_config::ServerConfig;

    if let Some(listen) = &cli.listen {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.listen_addr = listen.clone();
    }

    if let Some(phase) = &cli.phase {
        config.pipeline.phase = phase.clone();
    }

    if let Some(level) = &cli.log_level {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_level = level.clone();
    }

    Ok(())
}
