//! # RCON Bridge Library
//!
//! This library keeps authenticated remote-console sessions open to many game
//! servers at once, turns their console output into typed events, and runs
//! the in-game automation built on top of those events: kit claims, owner
//! zones and scheduled spawns and teleports.
//!
//! ## Core Responsibilities
//!
//! ### Connection Management
//! Every registered server gets its own connection task that:
//! - Connects and authenticates with bounded timeouts
//! - Reconnects with exponential backoff after any failure
//! - Correlates command responses with the command that caused them
//! - Probes idle connections so half-open sockets are noticed
//!
//! ### Event Routing
//! Console lines are classified into [`protocol::DomainEvent`]s and fanned
//! out to every subscribed subsystem. A slow subscriber sheds its oldest
//! events instead of stalling the connection that produced them.
//!
//! ### Subsystems
//! Each subsystem runs one worker per server, so per-server state is only
//! touched by one task and events for a server are handled in arrival order.
//!
//! ## Module Organization
//!
//! ### Connection Layer (`connection`, `correlator`, `backoff`, `manager`)
//! - One actor task per endpoint owning the socket and the correlator
//! - At most one command in flight per connection
//! - Registry keyed by server id with explicit add and remove
//!
//! ### Routing Layer (`router`, `worker`, `timer`)
//! - Bounded per-subscriber queues with drop-oldest shedding
//! - Per-server worker tasks with deadlines and periodic sweeps
//! - Keyed timers whose cancellation wins against an already fired timer
//!
//! ### Subsystems (`kits`, `zones`, `schedule`)
//! - Kit claims with authorization, cooldowns and retried delivery
//! - Zone lifecycle driven by owner presence and a grace period
//! - Recurring spawn commands and delayed teleports
//!
//! ### Collaborators (`store`, `notify`, `config`)
//! - Persistence behind the async [`store::Store`] trait
//! - Fire-and-forget operator notifications
//! - JSON configuration with defaults for every tuning value
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use bridge::config::BridgeConfig;
//! use bridge::notify::LogNotifier;
//! use bridge::service::Bridge;
//! use bridge::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::load("bridge.json")?;
//!     let store = Arc::new(MemoryStore::from_seed(config.seed.clone()));
//!
//!     // Starts subsystems, then connects to every endpoint in the store
//!     let bridge = Bridge::start(config, store, Arc::new(LogNotifier)).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod commands;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod kits;
pub mod manager;
pub mod mock;
pub mod model;
pub mod notify;
pub mod router;
pub mod schedule;
pub mod service;
pub mod store;
pub mod timer;
pub mod worker;
pub mod zones;

#[cfg(test)]
mod test_support;

pub use error::{BridgeError, CommandError, ConnectionError, StoreError};
pub use manager::{CommandSink, ConnectionManager};
pub use service::Bridge;
