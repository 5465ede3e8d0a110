//! # RCON Console
//!
//! Interactive operator tool for a single game server. It opens one bridge
//! connection, sends whatever the operator types as a console command and
//! prints the response, while tailing the server's parsed console events.
//!
//! ## Module Organization
//!
//! ### Repl Module (`repl`)
//! - Operator input parsing (`/status`, `/quit`, raw commands)
//! - The select loop over input, events and connection state

pub mod repl;
