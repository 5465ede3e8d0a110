//! Shared protocol types for the RCON bridge.
//!
//! - [`codec`]: length-prefixed RCON packet framing, restartable over any
//!   fragmentation of the byte stream.
//! - [`event`]: the closed set of console events the bridge understands.
//! - [`parser`]: classification of console lines into those events, plus
//!   reassembly of lines the server split across frames.
//!
//! Nothing in this crate performs I/O.

pub mod codec;
pub mod event;
pub mod parser;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use codec::{
    decode, encode, encode_to_vec, CodecError, Direction, FrameDecoder, Packet, PacketType,
    MAX_PACKET_SIZE, MAX_SERVER_BODY, MIN_PACKET_SIZE,
};
pub use event::{ChatChannel, Coordinate, DomainEvent, EventKind, Presence, ZoneTriggerKind};
pub use parser::{classify_line, Classification, EventParser, LineAssembler};

/// Identity of one registered game server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
