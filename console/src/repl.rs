//! Operator input handling.

use bridge::connection::{CommandSender, ConnectionState};
use bridge::router::{RouterMessage, Subscription};
use log::warn;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Raw console command for the server.
    Command(String),
    Status,
    Help,
    Quit,
    Empty,
}

/// Lines starting with `/` are console directives; anything else is sent
/// to the server verbatim.
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line {
        "/quit" | "/exit" => Input::Quit,
        "/status" => Input::Status,
        "/help" => Input::Help,
        _ => match line.strip_prefix("//") {
            // `//cmd` sends a command that itself starts with a slash
            Some(rest) => Input::Command(format!("/{}", rest)),
            None if line.starts_with('/') => Input::Help,
            None => Input::Command(line.to_string()),
        },
    }
}

pub const HELP: &str = "Commands:\n  <text>    run <text> on the server\n  /status   show the connection state\n  /quit     leave\n";

/// Reads operator lines from `input` until it ends or `/quit`, printing
/// responses, parsed events and state changes as they happen.
pub async fn run<R>(
    input: R,
    sender: CommandSender,
    mut events: Subscription,
    mut state: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                match parse_input(&line) {
                    Input::Command(text) => match sender.send(&text, timeout).await {
                        Ok(body) => println!("{}", body.trim_end()),
                        Err(e) => eprintln!("error: {}", e),
                    },
                    Input::Status => println!("{}: {:?}", sender.server(), sender.state()),
                    Input::Help => print!("{}", HELP),
                    Input::Quit => return Ok(()),
                    Input::Empty => {}
                }
            }
            message = events.recv() => match message {
                Some(RouterMessage::Event(event)) => println!("<{}> {:?}", event.server, event.kind),
                Some(_) => {}
                None => {
                    warn!("Event stream closed");
                    return Ok(());
                }
            },
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *state.borrow();
                println!("-- {:?}", current);
            }
        }
    }
}
