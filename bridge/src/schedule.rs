//! Scheduled in-game events.
//!
//! [`Spawner`] fires recurring spawn commands. On every tick each schedule
//! whose interval has passed since its last successful spawn gets exactly
//! one attempt; `last_spawn_at` only moves on success, so a failed spawn is
//! retried on the next tick and a long outage causes a single catch-up spawn
//! rather than one per missed interval.
//!
//! [`Teleports`] handles `<prefix> <position>` chat requests: after the
//! position's delay the player is teleported, unless they went offline in
//! the meantime.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use protocol::{get_timestamp, DomainEvent, EventKind, Presence, ServerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::commands;
use crate::config::ScheduleConfig;
use crate::manager::CommandSink;
use crate::model::{PositionSchedule, SpawnSchedule};
use crate::store::Store;
use crate::timer::Timers;
use crate::worker::ServerHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned { server: ServerId, event_key: String },
    Failed { server: ServerId, event_key: String, reason: String },
}

pub struct Spawner {
    store: Arc<dyn Store>,
    commands: Arc<dyn CommandSink>,
    timeout: Duration,
}

impl Spawner {
    pub fn new(store: Arc<dyn Store>, commands: Arc<dyn CommandSink>, timeout: Duration) -> Self {
        Self {
            store,
            commands,
            timeout,
        }
    }

    /// Attempts every schedule due at `now` (ms since the epoch).
    ///
    /// Servers are attempted concurrently, so an unreachable one does not
    /// hold up the others.
    pub async fn tick(&self, now: u64) -> Vec<SpawnOutcome> {
        let schedules = match self.store.spawn_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!("Spawn schedules unavailable: {}", e);
                return Vec::new();
            }
        };

        let mut attempts = JoinSet::new();
        for schedule in schedules.into_iter().filter(|s| s.is_due(now)) {
            let store = self.store.clone();
            let commands = self.commands.clone();
            let timeout = self.timeout;
            attempts.spawn(async move { spawn_once(schedule, store, commands, timeout, now).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Spawn attempt panicked: {}", e),
            }
        }
        outcomes
    }

    /// Ticks every `every` until shutdown.
    pub fn spawn(self, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let outcomes = self.tick(get_timestamp()).await;
                        if !outcomes.is_empty() {
                            debug!("Spawn tick: {} attempts", outcomes.len());
                        }
                    }
                }
            }
            debug!("Spawner stopped");
        })
    }
}

async fn spawn_once(
    schedule: SpawnSchedule,
    store: Arc<dyn Store>,
    commands: Arc<dyn CommandSink>,
    timeout: Duration,
    now: u64,
) -> SpawnOutcome {
    let SpawnSchedule {
        server,
        event_key,
        command,
        ..
    } = schedule;

    let failure = match commands.send_command(&server, &command, timeout).await {
        Ok(body) if !commands::response_is_error(&body, &[command.as_str()]) => None,
        Ok(body) => Some(body.trim().to_string()),
        Err(e) => Some(e.to_string()),
    };

    if let Some(reason) = failure {
        warn!("{}: spawn {} failed, will retry: {}", server, event_key, reason);
        return SpawnOutcome::Failed {
            server,
            event_key,
            reason,
        };
    }

    if let Err(e) = store.set_last_spawn(&server, &event_key, now).await {
        error!("{}: failed to record spawn {}: {}", server, event_key, e);
    }
    info!("{}: spawned {}", server, event_key);
    SpawnOutcome::Spawned { server, event_key }
}

/// Position from a teleport request, e.g. `!tp outpost` -> `outpost`.
pub fn parse_teleport<'a>(message: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = message.trim().strip_prefix(prefix)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let position = rest.trim();
    (!position.is_empty() && !position.contains(char::is_whitespace)).then_some(position)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleportRequest {
    Scheduled,
    AlreadyPending,
    OnCooldown,
    UnknownPosition,
}

#[derive(Debug)]
struct PendingTeleport {
    schedule: PositionSchedule,
}

/// Delayed teleports for one server.
pub struct Teleports {
    server: ServerId,
    store: Arc<dyn Store>,
    commands: Arc<dyn CommandSink>,
    config: ScheduleConfig,
    pending: HashMap<String, PendingTeleport>,
    cooldowns: HashMap<String, Instant>,
    timers: Timers<String>,
}

impl Teleports {
    pub fn new(
        server: ServerId,
        store: Arc<dyn Store>,
        commands: Arc<dyn CommandSink>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            server,
            store,
            commands,
            config,
            pending: HashMap::new(),
            cooldowns: HashMap::new(),
            timers: Timers::new(),
        }
    }

    pub fn is_pending(&self, player: &str) -> bool {
        self.pending.contains_key(player)
    }

    pub async fn request(&mut self, player: &str, position_type: &str, now: Instant) -> TeleportRequest {
        if self.pending.contains_key(player) {
            return TeleportRequest::AlreadyPending;
        }
        if self.cooldowns.get(player).map_or(false, |until| *until > now) {
            return TeleportRequest::OnCooldown;
        }

        let schedule = match self.store.position_schedule(&self.server, position_type).await {
            Ok(Some(schedule)) if schedule.enabled => schedule,
            Ok(_) => return TeleportRequest::UnknownPosition,
            Err(e) => {
                error!("{}: position lookup failed: {}", self.server, e);
                return TeleportRequest::UnknownPosition;
            }
        };

        debug!(
            "{}: teleport of {} to {} in {:?}",
            self.server, player, position_type, schedule.delay()
        );
        self.timers.schedule(player.to_string(), now + schedule.delay());
        self.pending.insert(player.to_string(), PendingTeleport { schedule });
        TeleportRequest::Scheduled
    }

    /// Cancels a pending teleport. Returns true if there was one.
    pub fn cancel(&mut self, player: &str) -> bool {
        let key = player.to_string();
        self.timers.cancel(&key);
        let cancelled = self.pending.remove(player).is_some();
        if cancelled {
            info!("{}: {} went offline, teleport cancelled", self.server, player);
        }
        cancelled
    }

    /// Runs teleports whose delay has elapsed.
    pub async fn run_due(&mut self, now: Instant) -> usize {
        let mut executed = 0;
        for fired in self.timers.due(now) {
            if !self.timers.complete(&fired) {
                continue;
            }
            let Some(pending) = self.pending.remove(&fired.key) else {
                continue;
            };

            let player = fired.key;
            let command = commands::teleport(&player, &pending.schedule.coordinate);
            match self
                .commands
                .send_command(&self.server, &command, self.config.command_timeout())
                .await
            {
                Ok(body) if !commands::response_is_error(&body, &[player.as_str()]) => {
                    info!(
                        "{}: teleported {} to {}",
                        self.server, player, pending.schedule.position_type
                    );
                    self.cooldowns
                        .insert(player, now + pending.schedule.cooldown());
                    executed += 1;
                }
                Ok(body) => warn!("{}: teleport of {} refused: {}", self.server, player, body.trim()),
                Err(e) => warn!("{}: teleport of {} failed: {}", self.server, player, e),
            }
        }
        executed
    }

    fn prune_cooldowns(&mut self, now: Instant) {
        self.cooldowns.retain(|_, until| *until > now);
    }
}

#[async_trait]
impl ServerHandler for Teleports {
    async fn handle_event(&mut self, event: &DomainEvent) {
        match &event.kind {
            EventKind::Chat { speaker, message, .. } => {
                if let Some(position) = parse_teleport(message, &self.config.teleport_prefix) {
                    let outcome = self.request(speaker, position, Instant::now()).await;
                    debug!("{}: teleport request by {}: {:?}", self.server, speaker, outcome);
                }
            }
            EventKind::PlayerPresence {
                player,
                transition: Presence::Offline,
            } => {
                self.cancel(player);
            }
            _ => {}
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    async fn on_deadline(&mut self, now: Instant) {
        self.run_due(now).await;
    }

    async fn sweep(&mut self) {
        self.prune_cooldowns(Instant::now());
    }

    async fn discard(&mut self) {
        self.pending.clear();
        self.cooldowns.clear();
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreSeed};
    use crate::test_support::{unavailable, ScriptedSink};
    use protocol::Coordinate;

    fn crate_schedule(server: &str, last: Option<u64>) -> SpawnSchedule {
        SpawnSchedule {
            server: ServerId::new(server),
            event_key: "airdrop".into(),
            command: "supply.call".into(),
            interval_secs: 60,
            last_spawn_at: last,
        }
    }

    fn spawner(seed: StoreSeed, sink: Arc<ScriptedSink>) -> (Spawner, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::from_seed(seed));
        (Spawner::new(store.clone(), sink, Duration::from_secs(1)), store)
    }

    #[tokio::test]
    async fn test_spawn_updates_last_spawn_on_success() {
        let sink = Arc::new(ScriptedSink::new());
        let seed = StoreSeed {
            spawn_schedules: vec![crate_schedule("eu-1", None)],
            ..StoreSeed::default()
        };
        let (spawner, store) = spawner(seed, sink.clone());

        let outcomes = spawner.tick(100_000).await;
        assert!(matches!(outcomes[0], SpawnOutcome::Spawned { .. }));
        assert_eq!(store.spawn_schedules().await.unwrap()[0].last_spawn_at, Some(100_000));

        // Not due again until the interval passes.
        assert!(spawner.tick(159_999).await.is_empty());
        assert_eq!(spawner.tick(160_000).await.len(), 1);
        assert_eq!(sink.sent(), vec!["supply.call", "supply.call"]);
    }

    #[tokio::test]
    async fn test_failed_spawn_keeps_last_spawn() {
        let sink = Arc::new(ScriptedSink::new());
        sink.otherwise(Err(unavailable("eu-1")));
        let seed = StoreSeed {
            spawn_schedules: vec![crate_schedule("eu-1", Some(0))],
            ..StoreSeed::default()
        };
        let (spawner, store) = spawner(seed, sink.clone());

        let outcomes = spawner.tick(60_000).await;
        assert!(matches!(outcomes[0], SpawnOutcome::Failed { .. }));
        assert_eq!(store.spawn_schedules().await.unwrap()[0].last_spawn_at, Some(0));

        // Retried on the next tick.
        assert_eq!(spawner.tick(61_000).await.len(), 1);
    }

    #[tokio::test]
    async fn test_one_catch_up_spawn_after_outage() {
        let sink = Arc::new(ScriptedSink::new());
        let seed = StoreSeed {
            spawn_schedules: vec![crate_schedule("eu-1", Some(0))],
            ..StoreSeed::default()
        };
        let (spawner, _store) = spawner(seed, sink.clone());

        // Ten intervals were missed.
        assert_eq!(spawner.tick(600_000).await.len(), 1);
        assert!(spawner.tick(600_001).await.is_empty());
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawner_task_ticks_until_shutdown() {
        let sink = Arc::new(ScriptedSink::new());
        let seed = StoreSeed {
            spawn_schedules: vec![crate_schedule("eu-1", None)],
            ..StoreSeed::default()
        };
        let (spawner, _store) = spawner(seed, sink.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = spawner.spawn(Duration::from_secs(30), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.sent().len(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    fn outpost(delay_secs: u64, enabled: bool) -> PositionSchedule {
        PositionSchedule {
            server: ServerId::new("eu-1"),
            position_type: "outpost".into(),
            enabled,
            delay_secs,
            cooldown_minutes: 5,
            coordinate: Coordinate::new(10.0, 5.0, 20.0),
        }
    }

    fn teleports(position: PositionSchedule, sink: Arc<ScriptedSink>) -> Teleports {
        let seed = StoreSeed {
            positions: vec![position],
            ..StoreSeed::default()
        };
        Teleports::new(
            ServerId::new("eu-1"),
            Arc::new(MemoryStore::from_seed(seed)),
            sink,
            ScheduleConfig::default(),
        )
    }

    #[test]
    fn test_parse_teleport() {
        assert_eq!(parse_teleport("!tp outpost", "!tp"), Some("outpost"));
        assert_eq!(parse_teleport("!tp", "!tp"), None);
        assert_eq!(parse_teleport("!tpoutpost", "!tp"), None);
        assert_eq!(parse_teleport("!tp out post", "!tp"), None);
    }

    #[tokio::test]
    async fn test_teleport_runs_after_delay() {
        let sink = Arc::new(ScriptedSink::new());
        let mut tp = teleports(outpost(10, true), sink.clone());
        let now = Instant::now();

        assert_eq!(tp.request("bob", "Outpost", now).await, TeleportRequest::Scheduled);
        assert_eq!(tp.request("bob", "outpost", now).await, TeleportRequest::AlreadyPending);

        assert_eq!(tp.run_due(now + Duration::from_secs(9)).await, 0);
        assert_eq!(tp.run_due(now + Duration::from_secs(10)).await, 1);
        assert_eq!(sink.sent(), vec!["teleportpos \"10.00,5.00,20.00\" \"bob\""]);
        assert!(!tp.is_pending("bob"));

        let later = now + Duration::from_secs(60);
        assert_eq!(tp.request("bob", "outpost", later).await, TeleportRequest::OnCooldown);
        let after_cooldown = now + Duration::from_secs(10 + 300);
        assert_eq!(
            tp.request("bob", "outpost", after_cooldown).await,
            TeleportRequest::Scheduled
        );
    }

    #[tokio::test]
    async fn test_offline_cancels_pending_teleport() {
        let sink = Arc::new(ScriptedSink::new());
        let mut tp = teleports(outpost(10, true), sink.clone());
        let now = Instant::now();

        tp.request("bob", "outpost", now).await;
        let offline = DomainEvent::new(
            ServerId::new("eu-1"),
            0,
            EventKind::PlayerPresence {
                player: "bob".into(),
                transition: Presence::Offline,
            },
        );
        tp.handle_event(&offline).await;

        assert_eq!(tp.run_due(now + Duration::from_secs(60)).await, 0);
        assert!(sink.sent().is_empty());
        assert!(tp.next_deadline().is_none());
    }

    #[tokio::test]
    async fn test_disabled_or_unknown_position() {
        let sink = Arc::new(ScriptedSink::new());
        let mut tp = teleports(outpost(0, false), sink.clone());

        let now = Instant::now();
        assert_eq!(tp.request("bob", "outpost", now).await, TeleportRequest::UnknownPosition);
        assert_eq!(tp.request("bob", "dome", now).await, TeleportRequest::UnknownPosition);
    }

    #[tokio::test]
    async fn test_failed_teleport_sets_no_cooldown() {
        let sink = Arc::new(ScriptedSink::new());
        sink.then(Err(unavailable("eu-1")));
        let mut tp = teleports(outpost(0, true), sink.clone());
        let now = Instant::now();

        tp.request("bob", "outpost", now).await;
        assert_eq!(tp.run_due(now).await, 0);
        assert_eq!(tp.request("bob", "outpost", now).await, TeleportRequest::Scheduled);
    }
}
