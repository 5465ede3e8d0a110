//! Player zone lifecycle.
//!
//! A zone is created GREEN when its owner claims it, turns YELLOW when the
//! owner goes offline (starting the grace timer), returns to GREEN if they
//! come back, and is deleted once the grace period runs out. The tracked
//! color only changes after the in-game command succeeded, so a failed
//! command leaves the previous state in place. A periodic sweep compares
//! the desired color of every zone with the tracked one and retries
//! whatever did not converge.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use protocol::{
    get_timestamp, Coordinate, DomainEvent, EventKind, Presence, ServerId, ZoneTriggerKind,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::commands;
use crate::config::ZoneConfig;
use crate::manager::CommandSink;
use crate::model::{TenantId, Zone, ZoneColor};
use crate::notify::{Notice, Notification, Notifier};
use crate::store::Store;
use crate::timer::Timers;
use crate::worker::ServerHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    Created,
    AlreadyOwned,
    Disabled,
    Failed,
}

#[derive(Debug)]
struct TrackedZone {
    zone: Zone,
    /// Delete regardless of presence: the owner asked for it, or creation
    /// may have half-succeeded.
    removal_requested: bool,
}

/// Zone state for one server.
pub struct ZoneLifecycle {
    server: ServerId,
    tenant: TenantId,
    store: Arc<dyn Store>,
    commands: Arc<dyn CommandSink>,
    notifier: Arc<dyn Notifier>,
    config: ZoneConfig,
    zones: BTreeMap<String, TrackedZone>,
    presence: HashMap<String, Presence>,
    timers: Timers<String>,
}

impl ZoneLifecycle {
    pub fn new(
        server: ServerId,
        store: Arc<dyn Store>,
        commands: Arc<dyn CommandSink>,
        notifier: Arc<dyn Notifier>,
        config: ZoneConfig,
    ) -> Self {
        Self {
            server,
            tenant: TenantId::default(),
            store,
            commands,
            notifier,
            config,
            zones: BTreeMap::new(),
            presence: HashMap::new(),
            timers: Timers::new(),
        }
    }

    /// Loads persisted zones and re-arms grace timers of yellow ones.
    pub async fn load(&mut self, now_ms: u64) {
        match self.store.endpoint(&self.server).await {
            Ok(Some(endpoint)) => self.tenant = endpoint.tenant,
            Ok(None) => {}
            Err(e) => error!("{}: failed to load endpoint: {}", self.server, e),
        }

        let zones = match self.store.zones(&self.server).await {
            Ok(zones) => zones,
            Err(e) => {
                error!("{}: failed to load zones: {}", self.server, e);
                return;
            }
        };

        for zone in zones {
            if zone.color == ZoneColor::Yellow {
                let remaining = zone.expires_at.unwrap_or(now_ms).saturating_sub(now_ms);
                self.timers
                    .schedule(zone.owner.clone(), Instant::now() + Duration::from_millis(remaining));
            }
            let removal_requested = zone.color == ZoneColor::Red;
            self.zones.insert(
                zone.owner.clone(),
                TrackedZone {
                    zone,
                    removal_requested,
                },
            );
        }
        if !self.zones.is_empty() {
            info!("{}: tracking {} persisted zones", self.server, self.zones.len());
        }
    }

    pub fn zone(&self, owner: &str) -> Option<&Zone> {
        self.zones.get(owner).map(|tracked| &tracked.zone)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Earliest grace expiry.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    async fn grace(&self) -> Duration {
        match self.store.zone_defaults(&self.server).await {
            Ok(Some(defaults)) => defaults.grace(),
            Ok(None) => Duration::from_secs(self.config.fallback_grace_secs),
            Err(e) => {
                warn!("{}: zone defaults unavailable: {}", self.server, e);
                Duration::from_secs(self.config.fallback_grace_secs)
            }
        }
    }

    async fn persist(&self, zone: &Zone) {
        if let Err(e) = self.store.put_zone(zone).await {
            error!("{}: failed to persist zone {}: {}", self.server, zone.name(), e);
        }
    }

    /// Creates a zone for `owner` at `position`.
    pub async fn claim(&mut self, owner: &str, position: Coordinate, now_ms: u64) -> ClaimResult {
        if self.zones.contains_key(owner) {
            debug!("{}: {} already owns a zone", self.server, owner);
            return ClaimResult::AlreadyOwned;
        }

        let defaults = match self.store.zone_defaults(&self.server).await {
            Ok(Some(defaults)) if defaults.enabled => defaults,
            Ok(_) => {
                debug!("{}: zones are disabled", self.server);
                return ClaimResult::Disabled;
            }
            Err(e) => {
                error!("{}: zone defaults unavailable: {}", self.server, e);
                return ClaimResult::Failed;
            }
        };

        self.presence.insert(owner.to_string(), Presence::Online);
        let mut zone = Zone::new(self.server.clone(), owner, position, defaults.radius, now_ms);
        let command = commands::create_zone(&zone);

        match self
            .commands
            .send_command(&self.server, &command, self.config.command_timeout())
            .await
        {
            Ok(body) if !commands::response_is_error(&body, &[zone.name().as_str()]) => {
                info!("{}: created zone {} at {}", self.server, zone.name(), position);
                self.persist(&zone).await;
                self.zones.insert(
                    owner.to_string(),
                    TrackedZone {
                        zone,
                        removal_requested: false,
                    },
                );
                ClaimResult::Created
            }
            Ok(body) => {
                warn!("{}: server refused zone {}: {}", self.server, zone.name(), body.trim());
                ClaimResult::Failed
            }
            Err(e) => {
                // The server may have created it anyway; track it for deletion.
                warn!("{}: creating zone {} failed: {}", self.server, zone.name(), e);
                zone.color = ZoneColor::Red;
                self.persist(&zone).await;
                self.zones.insert(
                    owner.to_string(),
                    TrackedZone {
                        zone,
                        removal_requested: true,
                    },
                );
                ClaimResult::Failed
            }
        }
    }

    /// Deletes `owner`'s zone on request. Returns true once it is gone.
    pub async fn request_removal(&mut self, owner: &str, now_ms: u64) -> bool {
        match self.zones.get_mut(owner) {
            Some(tracked) => tracked.removal_requested = true,
            None => return false,
        }
        self.apply(owner, ZoneColor::Red, now_ms).await
    }

    pub async fn player_online(&mut self, player: &str, now_ms: u64) {
        self.presence.insert(player.to_string(), Presence::Online);
        self.timers.cancel(&player.to_string());

        let yellow = self
            .zones
            .get(player)
            .map_or(false, |tracked| tracked.zone.color == ZoneColor::Yellow && !tracked.removal_requested);
        if yellow {
            self.apply(player, ZoneColor::Green, now_ms).await;
        }
    }

    pub async fn player_offline(&mut self, player: &str, now_ms: u64) {
        self.presence.insert(player.to_string(), Presence::Offline);

        let green = self
            .zones
            .get(player)
            .map_or(false, |tracked| tracked.zone.color == ZoneColor::Green && !tracked.removal_requested);
        if green {
            self.apply(player, ZoneColor::Yellow, now_ms).await;
        }
    }

    /// Deletes zones whose grace timer fired and was not cancelled.
    pub async fn expire_due(&mut self, now: Instant, now_ms: u64) {
        for fired in self.timers.due(now) {
            if !self.timers.complete(&fired) {
                continue;
            }
            let owner = fired.key;
            let online = self.presence.get(&owner) == Some(&Presence::Online);
            let yellow = self
                .zones
                .get(&owner)
                .map_or(false, |tracked| tracked.zone.color == ZoneColor::Yellow);
            if yellow && !online {
                info!("{}: grace period of {} ran out", self.server, owner);
                self.apply(&owner, ZoneColor::Red, now_ms).await;
            }
        }
    }

    fn desired_color(&self, tracked: &TrackedZone, now_ms: u64) -> ZoneColor {
        if tracked.removal_requested {
            return ZoneColor::Red;
        }
        let zone = &tracked.zone;
        match self.presence.get(&zone.owner) {
            Some(Presence::Online) => ZoneColor::Green,
            Some(Presence::Offline) if zone.is_expired(now_ms) => ZoneColor::Red,
            Some(Presence::Offline) => ZoneColor::Yellow,
            None if zone.color == ZoneColor::Yellow && zone.is_expired(now_ms) => ZoneColor::Red,
            None => zone.color,
        }
    }

    /// Retries every zone whose tracked color differs from its desired one.
    pub async fn reconcile(&mut self, now_ms: u64) {
        let pending: Vec<(String, ZoneColor)> = self
            .zones
            .iter()
            .filter_map(|(owner, tracked)| {
                let desired = self.desired_color(tracked, now_ms);
                (desired != tracked.zone.color || desired == ZoneColor::Red)
                    .then(|| (owner.clone(), desired))
            })
            .collect();

        for (owner, desired) in pending {
            debug!("{}: reconciling zone of {} to {:?}", self.server, owner, desired);
            self.apply(&owner, desired, now_ms).await;
        }
    }

    /// Issues the command that moves `owner`'s zone to `target` and records
    /// the new state only if it succeeded.
    async fn apply(&mut self, owner: &str, target: ZoneColor, now_ms: u64) -> bool {
        let Some(tracked) = self.zones.get(owner) else {
            return false;
        };
        let zone = tracked.zone.clone();
        let requested = tracked.removal_requested;

        let command = match target {
            ZoneColor::Red => commands::delete_zone(&zone),
            color => commands::recolor_zone(&zone, color),
        };
        let result = self
            .commands
            .send_command(&self.server, &command, self.config.command_timeout())
            .await;

        let name = zone.name();
        let echoed = [name.as_str()];
        let succeeded = match &result {
            Ok(body) if target == ZoneColor::Red && commands::response_is_missing(body, &echoed) => {
                true
            }
            Ok(body) => !commands::response_is_error(body, &echoed),
            Err(_) => false,
        };
        if !succeeded {
            let reason = match result {
                Ok(body) => body.trim().to_string(),
                Err(e) => e.to_string(),
            };
            warn!(
                "{}: moving zone {} to {:?} failed, keeping {:?}: {}",
                self.server,
                zone.name(),
                target,
                zone.color,
                reason
            );
            return false;
        }

        let key = owner.to_string();
        if target == ZoneColor::Red {
            self.zones.remove(owner);
            self.timers.cancel(&key);
            if let Err(e) = self.store.remove_zone(&self.server, owner).await {
                error!("{}: failed to remove zone record {}: {}", self.server, zone.name(), e);
            }
            info!("{}: deleted zone {}", self.server, zone.name());
            if !requested {
                self.notifier.notify(Notification::new(
                    self.tenant.clone(),
                    self.server.clone(),
                    Notice::ZoneExpired {
                        owner: owner.to_string(),
                    },
                ));
            }
            return true;
        }

        let grace = self.grace().await;
        let Some(tracked) = self.zones.get_mut(owner) else {
            return false;
        };
        tracked.zone.color = target;
        if target == ZoneColor::Yellow {
            tracked.zone.expires_at = Some(now_ms + grace.as_millis() as u64);
            self.timers.schedule(key, Instant::now() + grace);
        } else {
            tracked.zone.expires_at = None;
            self.timers.cancel(&key);
        }
        let zone = tracked.zone.clone();
        debug!("{}: zone {} is now {:?}", self.server, zone.name(), target);
        self.persist(&zone).await;
        true
    }
}

#[async_trait]
impl ServerHandler for ZoneLifecycle {
    async fn start(&mut self) {
        self.load(get_timestamp()).await;
    }

    async fn handle_event(&mut self, event: &DomainEvent) {
        let now_ms = get_timestamp();
        match &event.kind {
            EventKind::ZoneTrigger {
                player,
                kind: ZoneTriggerKind::Claim,
                position,
            } => {
                let result = self.claim(player, *position, now_ms).await;
                debug!("{}: zone claim by {}: {:?}", self.server, player, result);
            }
            EventKind::ZoneTrigger {
                player,
                kind: ZoneTriggerKind::Remove,
                ..
            } => {
                self.request_removal(player, now_ms).await;
            }
            EventKind::PlayerPresence {
                player,
                transition: Presence::Online,
            } => self.player_online(player, now_ms).await,
            EventKind::PlayerPresence {
                player,
                transition: Presence::Offline,
            } => self.player_offline(player, now_ms).await,
            _ => {}
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.next_expiry()
    }

    async fn on_deadline(&mut self, now: Instant) {
        self.expire_due(now, get_timestamp()).await;
    }

    async fn sweep(&mut self) {
        self.reconcile(get_timestamp()).await;
    }

    async fn discard(&mut self) {
        info!("{}: dropping {} zones", self.server, self.zones.len());
        self.zones.clear();
        self.presence.clear();
        self.timers.clear();
    }
}
