//! Stand-alone mock game server for trying the bridge locally.
//!
//! Every line typed on stdin is pushed to connected clients as console
//! output, e.g. `[CHAT GLOBAL] bob : !kit starter`.

use bridge::mock::{MockRconServer, MockReply};
use clap::Parser;
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "28016")]
    port: u16,

    /// Password clients must authenticate with
    #[arg(long, default_value = "changeme")]
    password: String,
}

fn respond(command: &str) -> MockReply {
    let verb = command.split_whitespace().next().unwrap_or_default();
    match verb {
        "serverinfo" => MockReply::Respond(
            "{\"Hostname\":\"mock\",\"Players\":0,\"MaxPlayers\":100}".to_string(),
        ),
        "" => MockReply::Respond(String::new()),
        _ => MockReply::Respond(format!("Executed: {}", command)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);
    let server = MockRconServer::bind(&address, &args.password, respond).await?;
    info!("Type console lines to broadcast them, Ctrl+C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => server.push_console(&line),
                None => {
                    // stdin closed; keep serving until Ctrl+C
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    info!("Commands received: {}", server.commands().len());
    server.stop().await;
    Ok(())
}
