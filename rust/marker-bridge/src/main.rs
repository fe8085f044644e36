// rust/marker-bridge/src/main.rs
// Bridge controller entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use marker_bridge::config::is_valid_log_level;
use marker_bridge::relay::RelaySequencer;
use marker_bridge::{
    logging, server, BridgeConfig, BridgeService, Coordinator, JsonFileStore, MarkerLink,
    ModbusClient, PlcWatcher,
};

/// Where job and sequence definitions persist between runs.
const JOB_STORE_FILE: &str = "job_store.json";

#[derive(Debug, Parser)]
#[command(
    name = "marker-bridge",
    about = "Bridge controller between a request socket, a laser marker, and a relay/PLC board"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "device_config.json")]
    config: PathBuf,

    /// Simulate both serial devices
    #[arg(long)]
    dry_run: bool,

    /// Simulate the relay/PLC board only
    #[arg(long)]
    dry_run_relay: bool,

    /// Simulate the marker only
    #[arg(long)]
    dry_run_command: bool,

    /// Override the configured log level
    #[arg(long, value_name = "off|error|warn|info|debug")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    if cli.dry_run || cli.dry_run_relay {
        config.devices.board_relay.dry_run = true;
    }
    if cli.dry_run || cli.dry_run_command {
        config.devices.software_command.dry_run = true;
    }
    if let Some(level) = &cli.log_level {
        anyhow::ensure!(is_valid_log_level(level), "invalid log level '{level}'");
        config.logging.level = level.to_ascii_lowercase();
    }

    let log_handle = logging::init(&config.logging);
    info!(config = %cli.config.display(), "marker-bridge starting");

    // Relay board: required at startup unless simulated
    let modbus = if config.devices.board_relay.dry_run {
        info!("BOARD_RELAY running dry");
        Arc::new(ModbusClient::dry_run(&config.devices.board_relay))
    } else {
        Arc::new(
            ModbusClient::connect(&config.devices.board_relay)
                .context("opening BOARD_RELAY port")?,
        )
    };

    // Marker: tolerated missing; commands answer NotConnected until
    // configured or switched to dry-run
    let link = MarkerLink::open(&config.devices.software_command, config.print_mode())
        .context("opening SOFTWARE_COMMAND port")?;
    if !link.is_connected() && !link.is_dry_run() {
        warn!("SOFTWARE_COMMAND has no com_port; marker commands will be rejected");
    }

    let store = Arc::new(JsonFileStore::open(JOB_STORE_FILE));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&link),
        RelaySequencer::new(Arc::clone(&modbus)),
    ));

    let watcher = PlcWatcher::new(Arc::clone(&modbus), Arc::clone(&coordinator), &config);
    let watcher_handle = watcher.spawn();

    let bind_address = config.server.bind_address.clone();
    let service = Arc::new(BridgeService::new(
        config,
        Some(cli.config.clone()),
        Arc::clone(&link),
        modbus,
        coordinator,
        store,
        Some(log_handle),
    ));

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding request socket {bind_address}"))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(server::serve(service, listener, shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    watcher.stop();
    link.shutdown();

    match tokio::time::timeout(Duration::from_secs(1), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "request server failed during shutdown"),
        Ok(Err(e)) => error!(error = %e, "request server panicked"),
        Err(_) => warn!("request server did not stop within 1s"),
    }
    if tokio::time::timeout(Duration::from_secs(1), watcher_handle)
        .await
        .is_err()
    {
        warn!("PLC watcher did not stop within 1s");
    }

    info!("serial ports closed");
    Ok(())
}
