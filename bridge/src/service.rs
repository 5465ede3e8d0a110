//! Wires the bridge together.
//!
//! [`Bridge::start`] builds the router and the connection registry, starts
//! one dispatcher per subsystem (kits, zones, teleports), starts the spawn
//! ticker and finally registers the endpoints found in the store. Workers
//! for servers already in the store start before their connections so that
//! persisted tasks and zones are resumed immediately.

use log::{info, warn};
use protocol::ServerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::kits::KitClaims;
use crate::manager::{CommandSink, ConnectionManager};
use crate::notify::Notifier;
use crate::router::EventRouter;
use crate::schedule::{Spawner, Teleports};
use crate::store::Store;
use crate::worker::{spawn_dispatcher, WorkerSettings};
use crate::zones::ZoneLifecycle;

pub struct Bridge {
    router: Arc<EventRouter>,
    manager: Arc<ConnectionManager>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub async fn start(
        config: BridgeConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(EventRouter::new(config.router.subscriber_queue));
        let manager = Arc::new(ConnectionManager::new(
            config.connection.clone(),
            router.clone(),
            notifier.clone(),
            store.clone(),
        ));
        let commands: Arc<dyn CommandSink> = manager.clone();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut initial: Vec<ServerId> = store.endpoints().await?.into_iter().map(|e| e.id).collect();
        initial.sort();

        let mut tasks = Vec::new();

        let kits = {
            let (store, commands, notifier) = (store.clone(), commands.clone(), notifier.clone());
            let kit_config = config.kits.clone();
            spawn_dispatcher(
                router.subscribe("kits"),
                move |server| {
                    KitClaims::new(
                        server,
                        store.clone(),
                        commands.clone(),
                        notifier.clone(),
                        kit_config.clone(),
                    )
                },
                WorkerSettings {
                    name: "kits".into(),
                    queue_capacity: config.router.worker_queue,
                    sweep_interval: Duration::from_millis(config.kits.sweep_interval_ms),
                },
                initial.clone(),
                shutdown_rx.clone(),
            )
        };
        tasks.push(kits);

        let zones = {
            let (store, commands, notifier) = (store.clone(), commands.clone(), notifier.clone());
            let zone_config = config.zones.clone();
            spawn_dispatcher(
                router.subscribe("zones"),
                move |server| {
                    ZoneLifecycle::new(
                        server,
                        store.clone(),
                        commands.clone(),
                        notifier.clone(),
                        zone_config.clone(),
                    )
                },
                WorkerSettings {
                    name: "zones".into(),
                    queue_capacity: config.router.worker_queue,
                    sweep_interval: Duration::from_millis(config.zones.sweep_interval_ms),
                },
                initial.clone(),
                shutdown_rx.clone(),
            )
        };
        tasks.push(zones);

        let teleports = {
            let (store, commands) = (store.clone(), commands.clone());
            let schedule_config = config.schedule.clone();
            spawn_dispatcher(
                router.subscribe("teleports"),
                move |server| Teleports::new(server, store.clone(), commands.clone(), schedule_config.clone()),
                WorkerSettings {
                    name: "teleports".into(),
                    queue_capacity: config.router.worker_queue,
                    sweep_interval: config.schedule.teleport_sweep(),
                },
                Vec::new(),
                shutdown_rx.clone(),
            )
        };
        tasks.push(teleports);

        let spawner = Spawner::new(store.clone(), commands, config.schedule.command_timeout());
        tasks.push(spawner.spawn(
            Duration::from_millis(config.schedule.spawn_tick_ms),
            shutdown_rx,
        ));

        let started = manager.load_endpoints().await?;
        info!("Bridge started with {} servers", started);

        Ok(Self {
            router,
            manager,
            shutdown,
            tasks,
        })
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Stops subsystems and closes every connection.
    pub async fn shutdown(self) {
        info!("Shutting down bridge");
        let _ = self.shutdown.send(true);
        self.manager.shutdown().await;
        self.router.close();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Bridge task failed: {}", e);
            }
        }
        info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::model::{ServerEndpoint, TenantId};
    use crate::notify::LogNotifier;
    use crate::store::{MemoryStore, StoreSeed};

    #[tokio::test]
    async fn test_start_registers_seeded_endpoints() {
        let seed = StoreSeed {
            endpoints: vec![ServerEndpoint {
                id: ServerId::new("eu-1"),
                tenant: TenantId::new("acme"),
                host: "127.0.0.1".into(),
                port: 1,
                password: "secret".into(),
            }],
            ..StoreSeed::default()
        };
        let store: Arc<dyn Store> = Arc::new(MemoryStore::from_seed(seed));

        let bridge = Bridge::start(BridgeConfig::default(), store, Arc::new(LogNotifier))
            .await
            .unwrap();
        let status = bridge.manager().status().await;
        assert_eq!(status.len(), 1);
        assert_ne!(status[0].state, ConnectionState::Ready);

        let names: Vec<String> = bridge.router().stats().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"kits".to_string()));
        assert!(names.contains(&"zones".to_string()));
        assert!(names.contains(&"teleports".to_string()));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = BridgeConfig::default();
        config.router.subscriber_queue = 0;
        let result = Bridge::start(config, Arc::new(MemoryStore::new()), Arc::new(LogNotifier)).await;
        assert!(result.is_err());
    }
}
