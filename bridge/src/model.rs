//! Records the bridge reads from and writes to the store.

use protocol::{Coordinate, ServerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Owner of one or more servers on the chat platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub id: ServerId,
    pub tenant: TenantId,
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl ServerEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Keeps the rcon password out of logs.
impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDefaults {
    pub server: ServerId,
    pub radius: f32,
    pub grace_secs: u64,
    pub enabled: bool,
}

impl ZoneDefaults {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneColor {
    /// Owner online.
    Green,
    /// Owner offline, grace period running.
    Yellow,
    /// Abandoned, being deleted.
    Red,
}

impl ZoneColor {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            ZoneColor::Green => (0, 255, 0),
            ZoneColor::Yellow => (255, 255, 0),
            ZoneColor::Red => (255, 0, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub server: ServerId,
    pub owner: String,
    pub center: Coordinate,
    pub radius: f32,
    pub color: ZoneColor,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Set while the zone is yellow.
    pub expires_at: Option<u64>,
}

impl Zone {
    pub fn new(server: ServerId, owner: &str, center: Coordinate, radius: f32, now: u64) -> Self {
        Self {
            server,
            owner: owner.to_string(),
            center,
            radius,
            color: ZoneColor::Green,
            created_at: now,
            expires_at: None,
        }
    }

    /// In-game name of the zone.
    ///
    /// ASCII letters, digits and `-` pass through; every other byte of the
    /// owner's UTF-8 name is written as `_XX`, so distinct owners always get
    /// distinct names.
    pub fn name(&self) -> String {
        let mut name = String::with_capacity(5 + self.owner.len());
        name.push_str("ZORP_");
        for byte in self.owner.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{:02X}", byte));
            }
        }
        name
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitDefinition {
    pub server: ServerId,
    pub kit: String,
    pub list_name: String,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KitAuthEntry {
    pub server: ServerId,
    pub list_name: String,
    pub player: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KitTaskState {
    Queued,
    InFlight,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitDeliveryTask {
    pub server: ServerId,
    pub player: String,
    pub kit: String,
    pub attempts: u32,
    /// Milliseconds since the Unix epoch.
    pub next_attempt_at: u64,
    pub state: KitTaskState,
}

impl KitDeliveryTask {
    pub fn new(server: ServerId, player: &str, kit: &str, now: u64) -> Self {
        Self {
            server,
            player: player.to_string(),
            kit: kit.to_string(),
            attempts: 0,
            next_attempt_at: now,
            state: KitTaskState::Queued,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, KitTaskState::Queued | KitTaskState::InFlight)
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.state == KitTaskState::Queued && self.next_attempt_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSchedule {
    pub server: ServerId,
    pub event_key: String,
    /// Console command that performs the spawn.
    pub command: String,
    pub interval_secs: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_spawn_at: Option<u64>,
}

impl SpawnSchedule {
    pub fn is_due(&self, now: u64) -> bool {
        match self.last_spawn_at {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval_secs * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSchedule {
    pub server: ServerId,
    pub position_type: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub delay_secs: u64,
    pub cooldown_minutes: u64,
    pub coordinate: Coordinate,
}

fn enabled_by_default() -> bool {
    true
}

impl PositionSchedule {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}
