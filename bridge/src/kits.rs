//! Kit claims.
//!
//! A player types `<prefix> <kit>` in chat. If the kit exists on that server,
//! the player is on the kit's authorization list, and no cooldown is running,
//! a delivery task is queued and persisted. Delivery runs the in-game grant
//! command and retries failures with exponential backoff until the attempt
//! limit, then gives up and tells the tenant.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use protocol::{get_timestamp, DomainEvent, EventKind, ServerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::commands;
use crate::config::KitConfig;
use crate::manager::CommandSink;
use crate::model::{KitDeliveryTask, KitTaskState, TenantId};
use crate::notify::{Notice, Notification, Notifier};
use crate::store::Store;
use crate::worker::ServerHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Queued,
    Duplicate,
    Denied,
    OnCooldown { until: u64 },
    UnknownKit,
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Retrying { attempts: u32, next_attempt_at: u64 },
    Failed { attempts: u32 },
    Unauthorized,
}

/// Kit name from a chat claim, e.g. `!kit starter` -> `starter`.
pub fn parse_claim<'a>(message: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = message.trim().strip_prefix(prefix)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut words = rest.split_whitespace();
    let kit = words.next()?;
    match words.next() {
        None => Some(kit),
        Some(_) => None,
    }
}

type TaskKey = (String, String);

/// Kit claim state for one server.
pub struct KitClaims {
    server: ServerId,
    tenant: TenantId,
    store: Arc<dyn Store>,
    commands: Arc<dyn CommandSink>,
    notifier: Arc<dyn Notifier>,
    config: KitConfig,
    tasks: BTreeMap<TaskKey, KitDeliveryTask>,
}

impl KitClaims {
    pub fn new(
        server: ServerId,
        store: Arc<dyn Store>,
        commands: Arc<dyn CommandSink>,
        notifier: Arc<dyn Notifier>,
        config: KitConfig,
    ) -> Self {
        Self {
            server,
            tenant: TenantId::default(),
            store,
            commands,
            notifier,
            config,
            tasks: BTreeMap::new(),
        }
    }

    /// Loads the tenant and any persisted tasks.
    ///
    /// A task that was in flight when the bridge stopped is queued again.
    pub async fn load(&mut self) {
        match self.store.endpoint(&self.server).await {
            Ok(Some(endpoint)) => self.tenant = endpoint.tenant,
            Ok(None) => debug!("{}: no endpoint record, notices go to the default tenant", self.server),
            Err(e) => error!("{}: failed to load endpoint: {}", self.server, e),
        }

        let tasks = match self.store.kit_tasks(&self.server).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("{}: failed to load kit tasks: {}", self.server, e);
                return;
            }
        };

        for mut task in tasks.into_iter().filter(KitDeliveryTask::is_active) {
            if task.state == KitTaskState::InFlight {
                task.state = KitTaskState::Queued;
                self.save(&task).await;
            }
            self.tasks.insert((task.player.clone(), task.kit.clone()), task);
        }
        if !self.tasks.is_empty() {
            info!("{}: resumed {} kit deliveries", self.server, self.tasks.len());
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    fn notify(&self, notice: Notice) {
        self.notifier
            .notify(Notification::new(self.tenant.clone(), self.server.clone(), notice));
    }

    async fn save(&self, task: &KitDeliveryTask) {
        if let Err(e) = self.store.put_kit_task(task).await {
            error!("{}: failed to persist kit task for {}: {}", self.server, task.player, e);
        }
    }

    async fn forget(&mut self, key: &TaskKey) {
        self.tasks.remove(key);
        if let Err(e) = self.store.remove_kit_task(&self.server, &key.0, &key.1).await {
            error!("{}: failed to remove kit task for {}: {}", self.server, key.0, e);
        }
    }

    /// Validates a claim and queues a delivery task.
    pub async fn claim(&mut self, player: &str, kit: &str, now: u64) -> ClaimOutcome {
        let key = (player.to_string(), kit.to_lowercase());
        if self.tasks.get(&key).map_or(false, KitDeliveryTask::is_active) {
            self.notify(Notice::KitDuplicate {
                player: player.to_string(),
                kit: kit.to_string(),
            });
            return ClaimOutcome::Duplicate;
        }

        let definition = match self.store.kit_definition(&self.server, kit).await {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                debug!("{}: {} claimed unknown kit {}", self.server, player, kit);
                return ClaimOutcome::UnknownKit;
            }
            Err(e) => {
                error!("{}: kit lookup failed: {}", self.server, e);
                return ClaimOutcome::StoreUnavailable;
            }
        };

        match self
            .store
            .kit_authorized(&self.server, &definition.list_name, player)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("{}: {} is not authorized for kit {}", self.server, player, kit);
                self.notify(Notice::KitDenied {
                    player: player.to_string(),
                    kit: kit.to_string(),
                });
                return ClaimOutcome::Denied;
            }
            Err(e) => {
                error!("{}: authorization lookup failed: {}", self.server, e);
                return ClaimOutcome::StoreUnavailable;
            }
        }

        match self.store.kit_cooldown(&self.server, player, kit).await {
            Ok(Some(until)) if until > now => {
                self.notify(Notice::KitOnCooldown {
                    player: player.to_string(),
                    kit: kit.to_string(),
                    until,
                });
                return ClaimOutcome::OnCooldown { until };
            }
            Ok(_) => {}
            Err(e) => {
                error!("{}: cooldown lookup failed: {}", self.server, e);
                return ClaimOutcome::StoreUnavailable;
            }
        }

        let task = KitDeliveryTask::new(self.server.clone(), player, &key.1, now);
        if let Err(e) = self.store.put_kit_task(&task).await {
            error!("{}: failed to persist kit task: {}", self.server, e);
            return ClaimOutcome::StoreUnavailable;
        }
        info!("{}: queued kit {} for {}", self.server, kit, player);
        self.tasks.insert(key, task);
        ClaimOutcome::Queued
    }

    fn next_attempt_at(&self) -> Option<u64> {
        self.tasks
            .values()
            .filter(|task| task.state == KitTaskState::Queued)
            .map(|task| task.next_attempt_at)
            .min()
    }

    /// Attempts every task that is due at `now`, oldest first.
    pub async fn deliver_due(&mut self, now: u64) -> Vec<(String, DeliveryOutcome)> {
        let mut due: Vec<(u64, TaskKey)> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.is_due(now))
            .map(|(key, task)| (task.next_attempt_at, key.clone()))
            .collect();
        due.sort();

        let mut outcomes = Vec::with_capacity(due.len());
        for (_, key) in due {
            if let Some(outcome) = self.deliver(&key, now).await {
                outcomes.push((key.0, outcome));
            }
        }
        outcomes
    }

    async fn deliver(&mut self, key: &TaskKey, now: u64) -> Option<DeliveryOutcome> {
        let mut task = self.tasks.get(key)?.clone();
        task.state = KitTaskState::InFlight;
        self.save(&task).await;

        // Authorization is checked again: it may have been revoked since the claim.
        let authorized = match self.store.kit_definition(&self.server, &task.kit).await {
            Ok(Some(definition)) => self
                .store
                .kit_authorized(&self.server, &definition.list_name, &task.player)
                .await
                .map(|ok| ok.then_some(definition)),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        let definition = match authorized {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                warn!("{}: {} lost access to kit {}", self.server, task.player, task.kit);
                self.forget(key).await;
                self.notify(Notice::KitDenied {
                    player: task.player,
                    kit: task.kit,
                });
                return Some(DeliveryOutcome::Unauthorized);
            }
            Err(e) => {
                error!("{}: store unavailable, deferring kit delivery: {}", self.server, e);
                task.state = KitTaskState::Queued;
                task.next_attempt_at = now + self.config.retry_delay(1).as_millis() as u64;
                self.save(&task).await;
                let outcome = DeliveryOutcome::Retrying {
                    attempts: task.attempts,
                    next_attempt_at: task.next_attempt_at,
                };
                self.tasks.insert(key.clone(), task);
                return Some(outcome);
            }
        };

        let command = commands::give_kit(&task.kit, &task.player);
        let echoed = [task.kit.as_str(), task.player.as_str()];
        let failure = match self
            .commands
            .send_command(&self.server, &command, self.config.command_timeout())
            .await
        {
            Ok(body) if !commands::response_is_error(&body, &echoed) => None,
            Ok(body) => Some(body.trim().to_string()),
            Err(e) => Some(e.to_string()),
        };

        let Some(reason) = failure else {
            info!("{}: delivered kit {} to {}", self.server, task.kit, task.player);
            self.forget(key).await;
            let until = now + definition.cooldown_secs * 1000;
            if let Err(e) = self
                .store
                .set_kit_cooldown(&self.server, &task.player, &task.kit, until)
                .await
            {
                error!("{}: failed to record kit cooldown: {}", self.server, e);
            }
            self.notify(Notice::KitDelivered {
                player: task.player,
                kit: task.kit,
            });
            return Some(DeliveryOutcome::Delivered);
        };

        task.attempts += 1;
        if task.attempts >= self.config.max_attempts {
            warn!(
                "{}: giving up on kit {} for {} after {} attempts: {}",
                self.server, task.kit, task.player, task.attempts, reason
            );
            self.forget(key).await;
            let attempts = task.attempts;
            self.notify(Notice::KitFailed {
                player: task.player,
                kit: task.kit,
                attempts,
                reason,
            });
            return Some(DeliveryOutcome::Failed { attempts });
        }

        let delay = self.config.retry_delay(task.attempts);
        task.state = KitTaskState::Queued;
        task.next_attempt_at = now + delay.as_millis() as u64;
        debug!(
            "{}: kit {} for {} failed ({}), retrying in {:?}",
            self.server, task.kit, task.player, reason, delay
        );
        self.save(&task).await;
        let outcome = DeliveryOutcome::Retrying {
            attempts: task.attempts,
            next_attempt_at: task.next_attempt_at,
        };
        self.tasks.insert(key.clone(), task);
        Some(outcome)
    }
}

#[async_trait]
impl ServerHandler for KitClaims {
    async fn start(&mut self) {
        self.load().await;
    }

    async fn handle_event(&mut self, event: &DomainEvent) {
        if let EventKind::Chat { speaker, message, .. } = &event.kind {
            if let Some(kit) = parse_claim(message, &self.config.trigger_prefix) {
                let outcome = self.claim(speaker, kit, get_timestamp()).await;
                debug!("{}: claim of {} by {}: {:?}", self.server, kit, speaker, outcome);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let at = self.next_attempt_at()?;
        let wait = at.saturating_sub(get_timestamp());
        Some(Instant::now() + Duration::from_millis(wait))
    }

    async fn on_deadline(&mut self, _now: Instant) {
        self.deliver_due(get_timestamp()).await;
    }

    async fn sweep(&mut self) {
        self.deliver_due(get_timestamp()).await;
    }

    async fn discard(&mut self) {
        info!("{}: dropping {} kit tasks", self.server, self.tasks.len());
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KitAuthEntry, KitDefinition};
    use crate::store::{MemoryStore, StoreSeed};
    use crate::test_support::{unavailable, RecordingNotifier, ScriptedSink};

    const SERVER: &str = "eu-1";

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<ScriptedSink>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            let seed = StoreSeed {
                kits: vec![KitDefinition {
                    server: ServerId::new(SERVER),
                    kit: "starter".into(),
                    list_name: "vip".into(),
                    cooldown_secs: 60,
                }],
                kit_auth: vec![KitAuthEntry {
                    server: ServerId::new(SERVER),
                    list_name: "vip".into(),
                    player: "alice".into(),
                }],
                ..StoreSeed::default()
            };
            Self {
                store: Arc::new(MemoryStore::from_seed(seed)),
                sink: Arc::new(ScriptedSink::new()),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn claims(&self) -> KitClaims {
            KitClaims::new(
                ServerId::new(SERVER),
                self.store.clone(),
                self.sink.clone(),
                self.notifier.clone(),
                KitConfig {
                    retry_base_ms: 1_000,
                    retry_max_ms: 8_000,
                    max_attempts: 3,
                    ..KitConfig::default()
                },
            )
        }
    }

    #[test]
    fn test_parse_claim() {
        assert_eq!(parse_claim("!kit starter", "!kit"), Some("starter"));
        assert_eq!(parse_claim("  !kit   starter  ", "!kit"), Some("starter"));
        assert_eq!(parse_claim("!kitstarter", "!kit"), None);
        assert_eq!(parse_claim("!kit", "!kit"), None);
        assert_eq!(parse_claim("!kit a b", "!kit"), None);
        assert_eq!(parse_claim("hello !kit starter", "!kit"), None);
    }

    #[tokio::test]
    async fn test_authorized_claim_is_delivered() {
        let fx = Fixture::new();
        let mut claims = fx.claims();
        fx.sink.then(Ok("Gave kit starter to alice".into()));

        assert_eq!(claims.claim("alice", "starter", 1_000).await, ClaimOutcome::Queued);
        assert_eq!(fx.store.kit_tasks(&ServerId::new(SERVER)).await.unwrap().len(), 1);

        let outcomes = claims.deliver_due(1_000).await;
        assert_eq!(outcomes, vec![("alice".to_string(), DeliveryOutcome::Delivered)]);
        assert_eq!(fx.sink.sent(), vec!["kit givetoplayer starter \"alice\""]);
        assert_eq!(claims.pending(), 0);
        assert!(fx.store.kit_tasks(&ServerId::new(SERVER)).await.unwrap().is_empty());
        assert_eq!(
            fx.notifier.notices(),
            vec![Notice::KitDelivered {
                player: "alice".into(),
                kit: "starter".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_player_name_with_error_word_gets_one_grant() {
        let fx = Fixture::new();
        fx.store
            .insert_kit_auth(KitAuthEntry {
                server: ServerId::new(SERVER),
                list_name: "vip".into(),
                player: "TerrorBear".into(),
            })
            .await;
        fx.sink.otherwise(Ok("Gave kit starter to TerrorBear".into()));
        let mut claims = fx.claims();

        assert_eq!(claims.claim("TerrorBear", "starter", 0).await, ClaimOutcome::Queued);
        let outcomes = claims.deliver_due(0).await;

        assert_eq!(outcomes, vec![("TerrorBear".to_string(), DeliveryOutcome::Delivered)]);
        assert_eq!(fx.sink.sent().len(), 1);
        assert!(claims.deliver_due(u64::MAX / 2).await.is_empty());
        assert_eq!(fx.sink.sent().len(), 1);
        assert!(matches!(fx.notifier.notices()[0], Notice::KitDelivered { .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_claim_denied_without_command() {
        let fx = Fixture::new();
        let mut claims = fx.claims();

        assert_eq!(claims.claim("mallory", "starter", 0).await, ClaimOutcome::Denied);
        assert!(claims.deliver_due(u64::MAX / 2).await.is_empty());
        assert!(fx.sink.sent().is_empty());
        assert!(matches!(fx.notifier.notices()[0], Notice::KitDenied { .. }));
    }

    #[tokio::test]
    async fn test_unknown_kit_ignored() {
        let fx = Fixture::new();
        let mut claims = fx.claims();
        assert_eq!(claims.claim("alice", "godmode", 0).await, ClaimOutcome::UnknownKit);
        assert!(fx.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_claim_rejected() {
        let fx = Fixture::new();
        let mut claims = fx.claims();

        assert_eq!(claims.claim("alice", "starter", 0).await, ClaimOutcome::Queued);
        assert_eq!(claims.claim("alice", "Starter", 10).await, ClaimOutcome::Duplicate);
        assert_eq!(claims.pending(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_claim() {
        let fx = Fixture::new();
        let mut claims = fx.claims();

        claims.claim("alice", "starter", 0).await;
        claims.deliver_due(0).await;

        assert_eq!(
            claims.claim("alice", "starter", 30_000).await,
            ClaimOutcome::OnCooldown { until: 60_000 }
        );
        assert_eq!(claims.claim("alice", "starter", 60_000).await, ClaimOutcome::Queued);
    }

    #[tokio::test]
    async fn test_failures_back_off_then_give_up() {
        let fx = Fixture::new();
        let mut claims = fx.claims();
        fx.sink.otherwise(Err(unavailable(SERVER)));

        claims.claim("alice", "starter", 0).await;

        let outcomes = claims.deliver_due(0).await;
        assert_eq!(
            outcomes[0].1,
            DeliveryOutcome::Retrying {
                attempts: 1,
                next_attempt_at: 1_000
            }
        );

        // Not due yet.
        assert!(claims.deliver_due(999).await.is_empty());

        let outcomes = claims.deliver_due(1_000).await;
        assert_eq!(
            outcomes[0].1,
            DeliveryOutcome::Retrying {
                attempts: 2,
                next_attempt_at: 3_000
            }
        );

        let outcomes = claims.deliver_due(3_000).await;
        assert_eq!(outcomes[0].1, DeliveryOutcome::Failed { attempts: 3 });
        assert_eq!(claims.pending(), 0);
        assert!(fx.store.kit_tasks(&ServerId::new(SERVER)).await.unwrap().is_empty());
        assert!(matches!(
            fx.notifier.notices().last(),
            Some(Notice::KitFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_error_response_counts_as_failure() {
        let fx = Fixture::new();
        let mut claims = fx.claims();
        fx.sink.then(Ok("Couldn't find player alice".into()));

        claims.claim("alice", "starter", 0).await;
        let outcomes = claims.deliver_due(0).await;
        assert!(matches!(outcomes[0].1, DeliveryOutcome::Retrying { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_revoked_authorization_never_delivers() {
        let fx = Fixture::new();
        let mut claims = fx.claims();
        claims.claim("alice", "starter", 0).await;

        fx.store
            .revoke_kit_auth(&KitAuthEntry {
                server: ServerId::new(SERVER),
                list_name: "vip".into(),
                player: "alice".into(),
            })
            .await;

        let outcomes = claims.deliver_due(0).await;
        assert_eq!(outcomes[0].1, DeliveryOutcome::Unauthorized);
        assert!(fx.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_task_resumes_after_restart() {
        let fx = Fixture::new();
        let mut task = KitDeliveryTask::new(ServerId::new(SERVER), "alice", "starter", 0);
        task.state = KitTaskState::InFlight;
        task.attempts = 1;
        fx.store.put_kit_task(&task).await.unwrap();

        let mut claims = fx.claims();
        claims.load().await;
        assert_eq!(claims.pending(), 1);
        assert_eq!(
            fx.store.kit_tasks(&ServerId::new(SERVER)).await.unwrap()[0].state,
            KitTaskState::Queued
        );

        let outcomes = claims.deliver_due(0).await;
        assert_eq!(outcomes[0].1, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_chat_event_triggers_claim() {
        let fx = Fixture::new();
        let mut claims = fx.claims();

        let event = DomainEvent::new(
            ServerId::new(SERVER),
            0,
            EventKind::Chat {
                speaker: "alice".into(),
                channel: protocol::ChatChannel::Global,
                message: "!kit starter".into(),
            },
        );
        claims.handle_event(&event).await;

        assert_eq!(claims.pending(), 1);
        assert!(claims.next_deadline().is_some());
    }
}
