//! Bridge configuration.
//!
//! Loaded from a JSON file. Every tuning value has a default, so an empty
//! object `{}` is a valid configuration. The optional `seed` section carries
//! the records the store starts out with.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::store::StoreSeed;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub router: RouterConfig,
    pub kits: KitConfig,
    pub zones: ZoneConfig,
    pub schedule: ScheduleConfig,
    pub seed: StoreSeed,
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.backoff_min_ms == 0 || c.backoff_min_ms > c.backoff_max_ms {
            return Err(BridgeError::Config(format!(
                "backoff_min_ms ({}) must be non-zero and at most backoff_max_ms ({})",
                c.backoff_min_ms, c.backoff_max_ms
            )));
        }
        if c.command_queue == 0 || self.router.subscriber_queue == 0 || self.router.worker_queue == 0
        {
            return Err(BridgeError::Config("queue capacities must be non-zero".into()));
        }
        if self.kits.max_attempts == 0 {
            return Err(BridgeError::Config("kits.max_attempts must be at least 1".into()));
        }
        if self.kits.trigger_prefix.trim().is_empty()
            || self.schedule.teleport_prefix.trim().is_empty()
        {
            return Err(BridgeError::Config("chat trigger prefixes must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// A READY period at least this long resets the backoff.
    pub stability_threshold_ms: u64,
    /// Idle time before a liveness probe is sent. Zero disables probing.
    pub keepalive_idle_ms: u64,
    pub keepalive_command: String,
    /// Commands waiting behind the in-flight one.
    pub command_queue: usize,
    /// Use sentinel frames to collect responses split over several frames.
    pub multi_part_responses: bool,
    pub max_frame_size: usize,
    /// Publish unrecognized console lines as generic events.
    pub emit_generic_events: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            auth_timeout_ms: 5_000,
            command_timeout_ms: 5_000,
            backoff_min_ms: 1_000,
            backoff_max_ms: 60_000,
            stability_threshold_ms: 30_000,
            keepalive_idle_ms: 60_000,
            keepalive_command: "serverinfo".to_string(),
            command_queue: 64,
            multi_part_responses: true,
            max_frame_size: protocol::MAX_PACKET_SIZE,
            emit_generic_events: false,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keepalive_idle(&self) -> Option<Duration> {
        (self.keepalive_idle_ms > 0).then(|| Duration::from_millis(self.keepalive_idle_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Events buffered per subscriber before the oldest is shed.
    pub subscriber_queue: usize,
    /// Events buffered per server worker before the oldest is shed.
    pub worker_queue: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 1024,
            worker_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KitConfig {
    pub trigger_prefix: String,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_attempts: u32,
    pub command_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            trigger_prefix: "!kit".to_string(),
            retry_base_ms: 5_000,
            retry_max_ms: 300_000,
            max_attempts: 5,
            command_timeout_ms: 10_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl KitConfig {
    /// Delay before attempt `attempts + 1`, doubling per failure.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let delay = self.retry_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_max_ms))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub sweep_interval_ms: u64,
    pub command_timeout_ms: u64,
    /// Grace period used when a server has no zone defaults.
    pub fallback_grace_secs: u64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            command_timeout_ms: 10_000,
            fallback_grace_secs: 3_600,
        }
    }
}

impl ZoneConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub spawn_tick_ms: u64,
    pub teleport_prefix: String,
    pub command_timeout_ms: u64,
    /// How often teleport workers prune expired cooldowns.
    pub teleport_sweep_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            spawn_tick_ms: 30_000,
            teleport_prefix: "!tp".to_string(),
            command_timeout_ms: 10_000,
            teleport_sweep_ms: 300_000,
        }
    }
}

impl ScheduleConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn teleport_sweep(&self) -> Duration {
        Duration::from_millis(self.teleport_sweep_ms)
    }
}
