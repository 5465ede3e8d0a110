use bridge::config::ConnectionConfig;
use bridge::connection::ConnectionHandle;
use bridge::model::{ServerEndpoint, TenantId};
use bridge::notify::LogNotifier;
use bridge::router::EventRouter;
use clap::Parser;
use console::repl;
use log::info;
use protocol::ServerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Game server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// RCON port
    #[arg(short, long, default_value = "28016")]
    port: u16,

    /// RCON password
    #[arg(long)]
    password: String,

    /// Seconds to wait for a command response
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    /// Also print console lines that match no known event
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let endpoint = ServerEndpoint {
        id: ServerId::new(format!("{}:{}", args.host, args.port)),
        tenant: TenantId::default(),
        host: args.host,
        port: args.port,
        password: args.password,
    };
    let config = ConnectionConfig {
        emit_generic_events: args.raw,
        ..ConnectionConfig::default()
    };

    let router = Arc::new(EventRouter::new(1024));
    let events = router.subscribe("console");

    info!("Connecting to {}", endpoint.address());
    let handle = ConnectionHandle::spawn(endpoint, config, router.clone(), Arc::new(LogNotifier));
    print!("{}", repl::HELP);

    let result = repl::run(
        BufReader::new(tokio::io::stdin()),
        handle.sender(),
        events,
        handle.subscribe_state(),
        Duration::from_secs(args.timeout),
    )
    .await;

    handle.close().await;
    router.close();
    result?;
    Ok(())
}
