use bridge::config::BridgeConfig;
use bridge::notify::LogNotifier;
use bridge::service::Bridge;
use bridge::store::MemoryStore;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot file for kit tasks, zones and spawn times
    #[arg(short, long)]
    state_file: Option<PathBuf>,

    /// Seconds between connection status lines (0 disables them)
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            BridgeConfig::load(path)?
        }
        None => BridgeConfig::default(),
    };

    let mut store = MemoryStore::from_seed(config.seed.clone());
    if let Some(path) = &args.state_file {
        store = store.with_snapshot(path).await?;
    }

    let bridge = Bridge::start(config, Arc::new(store), Arc::new(LogNotifier)).await?;

    let mut status = interval(Duration::from_secs(args.status_interval.max(1)));
    status.set_missed_tick_behavior(MissedTickBehavior::Skip);
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            _ = status.tick(), if args.status_interval > 0 => {
                for endpoint in bridge.manager().status().await {
                    info!(
                        "{} ({}) tenant={} state={:?}{}",
                        endpoint.server,
                        endpoint.address,
                        endpoint.tenant,
                        endpoint.state,
                        if endpoint.auth_rejected { " AUTH REJECTED" } else { "" }
                    );
                }
                for stats in bridge.router().stats() {
                    if stats.dropped > 0 {
                        warn!("Subscriber {} has shed {} events", stats.name, stats.dropped);
                    }
                }
            }
        }
    }

    bridge.shutdown().await;
    Ok(())
}
