//! Acoustic telemetry node binary.
//!
//! Runs one node (queue manager, TDMA MAC, transport driver and optional relay
//! routing) from a YAML configuration, or a store server for the request/reply
//! transport.

use acomms_driver::StoreServer;
use acomms_wire::{ModemId, SystemClock};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod node;

use config::NodeConfig;
use logging::AcommsLogFormatter;
use node::{log_queue_event, Node};

/// Acoustic telemetry node
#[derive(Parser, Debug)]
#[command(name = "acomms-node", version, about = "Acoustic telemetry link layer node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Node id, overriding the configuration file
    #[arg(long)]
    modem_id: Option<ModemId>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Time between component passes, overriding the configuration file
    #[arg(long)]
    tick: Option<humantime::Duration>,

    /// Wait before restarting after a fatal transport error, overriding the configuration file
    #[arg(long)]
    restart_backoff: Option<humantime::Duration>,

    /// Run a store server on this address instead of a node, e.g. 0.0.0.0:50010
    #[arg(long)]
    store_server: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut node_config = match args.store_server {
        Some(_) => NodeConfig::default(),
        None => NodeConfig::load_from_file(&args.config)?,
    };
    if let Some(id) = args.modem_id {
        node_config.modem_id = Some(id);
        node_config.apply_modem_id();
    }
    let log_level = args.log_level.clone().unwrap_or_else(|| node_config.log_level.clone());

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "acomms_node",
        "acomms_wire",
        "acomms_queue",
        "acomms_mac",
        "acomms_driver",
        "acomms_route",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(AcommsLogFormatter::new("acomms"))
        .init();

    info!("Starting acomms node v{}", env!("CARGO_PKG_VERSION"));

    if let Some(address) = args.store_server {
        let tick = args.tick.map(Duration::from).unwrap_or(Duration::from_millis(10));
        return run_store_server(&address, tick).await;
    }

    info!(
        "Loaded configuration from {:?}: modem_id={} transport={:?}",
        args.config, node_config.queue.modem_id, node_config.driver.transport
    );

    let tick = match args.tick {
        Some(tick) => tick.into(),
        None => node_config.tick_interval()?,
    };
    let backoff = match args.restart_backoff {
        Some(backoff) => backoff.into(),
        None => node_config.restart_backoff()?,
    };

    run_node(node_config, tick, backoff).await
}

async fn run_node(config: NodeConfig, tick: Duration, backoff: Duration) -> anyhow::Result<()> {
    let mut node = Node::new(config, Arc::new(SystemClock))?;
    node.startup()?;

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = interval.tick() => match node.tick() {
                Ok(events) => events.iter().for_each(log_queue_event),
                Err(e) => {
                    component_error!("driver", "Fatal transport error: {}; restarting in {:?}", e, backoff);
                    node.shutdown();
                    tokio::time::sleep(backoff).await;
                    if let Err(e) = node.startup() {
                        component_error!("node", "Restart failed: {}", e);
                    }
                }
            },
        }
    }

    node.shutdown();
    info!("Acomms node shutdown complete");
    Ok(())
}

async fn run_store_server(address: &str, tick: Duration) -> anyhow::Result<()> {
    let mut server = StoreServer::bind(address)?;
    component_info!("store", "Store server listening on {}", server.local_addr()?);

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;
    let mut interval = tokio::time::interval(tick);

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = interval.tick() => {
                if let Err(e) = server.do_work() {
                    component_warn!("store", "Store server error: {}", e);
                }
            }
        }
    }

    info!("Store server stopped with {} clients connected", server.client_count());
    Ok(())
}
