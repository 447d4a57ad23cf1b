//! OBD Bridge - Main Entry Point

use anyhow::Context;
use bridge::{init_logging, Bridge, BridgeConfig};
use clap::Parser;
use obd_protocol::SerialConnector;
use std::path::PathBuf;
use tracing::{info, Level};

/// Config file read when `--config` is not given; it may be absent
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Relays an ELM327 OBD-II adapter to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "obd-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<Level>,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let mut config = BridgeConfig::load(Some(&path), required)
        .with_context(|| format!("invalid configuration ({})", path.display()))?;

    let level = match cli.log_level {
        Some(level) => {
            config.logging.level = level.to_string().to_lowercase();
            level
        }
        None => config.logging.max_level()?,
    };

    if cli.check_config {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    init_logging(level, config.logging.format).context("failed to install log subscriber")?;

    info!("=== OBD Bridge v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Device: {}, broker: {}", config.link.device_path, config.mqtt.broker);

    let link = config.link_config();
    let connector = SerialConnector::new(link.baud_rate, link.connect_timeout);
    let bridge = Bridge::start(&config, connector)?;

    wait_for_shutdown().await?;
    info!("Shutdown signal received");

    bridge.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    Ok(())
}
