//! Typed console events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::ServerId;

/// A world position as printed by the game console.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Coordinate {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Coordinate) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2},{:.2},{:.2}", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCoordinateError(pub String);

impl fmt::Display for ParseCoordinateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid coordinate: {}", self.0)
    }
}

impl std::error::Error for ParseCoordinateError {}

impl FromStr for Coordinate {
    type Err = ParseCoordinateError;

    /// Accepts `(x, y, z)` and `x,y,z`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')');

        let parts: Vec<f32> = inner
            .split(',')
            .map(|part| part.trim().parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseCoordinateError(s.to_string()))?;

        match parts.as_slice() {
            [x, y, z] if x.is_finite() && y.is_finite() && z.is_finite() => {
                Ok(Coordinate::new(*x, *y, *z))
            }
            _ => Err(ParseCoordinateError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChannel {
    Global,
    Team,
    Local,
    Other(String),
}

impl ChatChannel {
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_uppercase().as_str() {
            "GLOBAL" => ChatChannel::Global,
            "TEAM" => ChatChannel::Team,
            "LOCAL" => ChatChannel::Local,
            _ => ChatChannel::Other(tag.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneTriggerKind {
    Claim,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Kill {
        killer: String,
        victim: String,
        weapon: String,
    },
    Chat {
        speaker: String,
        channel: ChatChannel,
        message: String,
    },
    Save {
        elapsed: Duration,
    },
    ZoneTrigger {
        player: String,
        kind: ZoneTriggerKind,
        position: Coordinate,
    },
    PlayerPresence {
        player: String,
        transition: Presence,
    },
    Generic {
        line: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Kill { .. } => "kill",
            EventKind::Chat { .. } => "chat",
            EventKind::Save { .. } => "save",
            EventKind::ZoneTrigger { .. } => "zone_trigger",
            EventKind::PlayerPresence { .. } => "presence",
            EventKind::Generic { .. } => "generic",
        }
    }
}

/// One classified console line from one server.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub server: ServerId,
    /// Receive time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(server: ServerId, timestamp: u64, kind: EventKind) -> Self {
        Self {
            server,
            timestamp,
            kind,
        }
    }

    /// The player this event is about, if it is about exactly one.
    pub fn player(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Chat { speaker, .. } => Some(speaker),
            EventKind::ZoneTrigger { player, .. } => Some(player),
            EventKind::PlayerPresence { player, .. } => Some(player),
            _ => None,
        }
    }
}
