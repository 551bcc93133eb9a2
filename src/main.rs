use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use lorabridge::backend::basicstation::Backend;
use lorabridge::{config, logging};

#[derive(Parser)]
#[command(name = "lorabridge", version, about = "BasicStation LNS bridge")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print a commented configuration template.
    Configfile,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Configfile) => {
            print!("{}", config::default_template());
            Ok(())
        }
        None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config::Settings::load(config_path)?;
    logging::init_logging(logging::LogConfig::from_settings(&settings.logging))?;

    info!("lorabridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        region = %settings.backend.basic_station.region,
        bind = %settings.backend.basic_station.bind,
        "starting BasicStation backend"
    );

    let backend = Backend::new(&settings)?;
    register_event_logging(&backend);
    backend.start()?;
    info!("listening on {}", backend.local_addr());

    let reason = await_shutdown_trigger().await;
    info!("shutdown signal received ({})", reason);
    backend.stop();

    // Brief grace period so in-flight connection handlers can run their
    // cleanup paths.
    tokio::time::sleep(Duration::from_millis(250)).await;
    info!("bridge shut down");
    Ok(())
}

/// The upstream transport is wired by whatever integration embeds this
/// crate; the standalone binary logs every event it would deliver.
fn register_event_logging(backend: &Backend) {
    backend.set_uplink_frame_callback(|frame| {
        debug!(
            gateway_id = %frame.rx_info.gateway_id,
            uplink_id = %frame.rx_info.uplink_id,
            frequency = frame.tx_info.frequency,
            phy_payload = %hex::encode(&frame.phy_payload),
            "uplink frame"
        );
    });
    backend.set_downlink_txack_callback(|ack| {
        debug!(
            gateway_id = %ack.gateway_id,
            token = ack.token,
            "downlink tx ack"
        );
    });
    backend.set_gateway_stats_callback(|stats| {
        debug!(
            gateway_id = %stats.gateway_id,
            stats_id = %stats.stats_id,
            rx = stats.rx_packets_received,
            rx_ok = stats.rx_packets_received_ok,
            tx = stats.tx_packets_received,
            tx_ok = stats.tx_packets_emitted,
            "gateway stats"
        );
    });
    backend.set_raw_packet_forwarder_event_callback(|event| {
        debug!(
            gateway_id = %event.gateway_id,
            raw_id = %event.raw_id,
            "raw packet-forwarder event"
        );
    });
    backend.set_subscribe_event_callback(|event| {
        debug!(
            gateway_id = %event.gateway_id,
            subscribe = event.subscribe,
            "gateway subscription changed"
        );
    });
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("Failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
