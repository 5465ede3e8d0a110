//! Persistence boundary.
//!
//! Subsystems read configuration records (endpoints, zone defaults, kit
//! definitions and authorizations, schedules) and read and write their own
//! mutable records (delivery tasks, cooldowns, zones, spawn times) through
//! the [`Store`] trait. Reads are point-in-time snapshots.
//!
//! [`MemoryStore`] keeps everything in memory and can mirror the mutable
//! records to a bincode snapshot file so tasks and zones survive a restart.

use async_trait::async_trait;
use log::{debug, info};
use protocol::ServerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{
    KitAuthEntry, KitDefinition, KitDeliveryTask, PositionSchedule, ServerEndpoint, SpawnSchedule,
    Zone, ZoneDefaults,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn endpoints(&self) -> StoreResult<Vec<ServerEndpoint>>;
    async fn endpoint(&self, server: &ServerId) -> StoreResult<Option<ServerEndpoint>>;
    async fn put_endpoint(&self, endpoint: ServerEndpoint) -> StoreResult<()>;

    async fn zone_defaults(&self, server: &ServerId) -> StoreResult<Option<ZoneDefaults>>;

    async fn kit_definition(&self, server: &ServerId, kit: &str) -> StoreResult<Option<KitDefinition>>;
    async fn kit_authorized(&self, server: &ServerId, list_name: &str, player: &str) -> StoreResult<bool>;
    /// Time until which `player` may not claim `kit` again.
    async fn kit_cooldown(&self, server: &ServerId, player: &str, kit: &str) -> StoreResult<Option<u64>>;
    async fn set_kit_cooldown(&self, server: &ServerId, player: &str, kit: &str, until: u64) -> StoreResult<()>;
    async fn kit_tasks(&self, server: &ServerId) -> StoreResult<Vec<KitDeliveryTask>>;
    async fn put_kit_task(&self, task: &KitDeliveryTask) -> StoreResult<()>;
    async fn remove_kit_task(&self, server: &ServerId, player: &str, kit: &str) -> StoreResult<()>;

    async fn zones(&self, server: &ServerId) -> StoreResult<Vec<Zone>>;
    async fn put_zone(&self, zone: &Zone) -> StoreResult<()>;
    async fn remove_zone(&self, server: &ServerId, owner: &str) -> StoreResult<()>;

    async fn spawn_schedules(&self) -> StoreResult<Vec<SpawnSchedule>>;
    async fn set_last_spawn(&self, server: &ServerId, event_key: &str, at: u64) -> StoreResult<()>;
    async fn position_schedule(&self, server: &ServerId, position_type: &str) -> StoreResult<Option<PositionSchedule>>;

    /// Deletes every record belonging to `server`.
    ///
    /// Later writes for `server` fail with `ServerRemoved` until it is
    /// registered again with `put_endpoint`.
    async fn purge_server(&self, server: &ServerId) -> StoreResult<()>;
}

/// Records a store starts out with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSeed {
    pub endpoints: Vec<ServerEndpoint>,
    pub zone_defaults: Vec<ZoneDefaults>,
    pub kits: Vec<KitDefinition>,
    pub kit_auth: Vec<KitAuthEntry>,
    pub spawn_schedules: Vec<SpawnSchedule>,
    pub positions: Vec<PositionSchedule>,
}

type PlayerKitKey = (ServerId, String, String);

/// Records written by the subsystems; this is what the snapshot holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MutableState {
    kit_tasks: BTreeMap<PlayerKitKey, KitDeliveryTask>,
    cooldowns: BTreeMap<PlayerKitKey, u64>,
    zones: BTreeMap<(ServerId, String), Zone>,
    last_spawn: BTreeMap<(ServerId, String), u64>,
}

impl MutableState {
    fn purge(&mut self, server: &ServerId) {
        self.kit_tasks.retain(|(s, _, _), _| s != server);
        self.cooldowns.retain(|(s, _, _), _| s != server);
        self.zones.retain(|(s, _), _| s != server);
        self.last_spawn.retain(|(s, _), _| s != server);
    }
}

#[derive(Debug, Default)]
struct StoreData {
    endpoints: BTreeMap<ServerId, ServerEndpoint>,
    zone_defaults: HashMap<ServerId, ZoneDefaults>,
    kits: HashMap<(ServerId, String), KitDefinition>,
    kit_auth: HashSet<KitAuthEntry>,
    spawn_schedules: Vec<SpawnSchedule>,
    positions: HashMap<(ServerId, String), PositionSchedule>,
    state: MutableState,
    /// Purged servers; their records must not come back.
    removed: HashSet<ServerId>,
}

fn kit_key(kit: &str) -> String {
    kit.trim().to_lowercase()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let mut data = StoreData::default();

        for endpoint in seed.endpoints {
            data.endpoints.insert(endpoint.id.clone(), endpoint);
        }
        for defaults in seed.zone_defaults {
            data.zone_defaults.insert(defaults.server.clone(), defaults);
        }
        for kit in seed.kits {
            data.kits.insert((kit.server.clone(), kit_key(&kit.kit)), kit);
        }
        data.kit_auth.extend(seed.kit_auth);
        for schedule in &seed.spawn_schedules {
            if let Some(at) = schedule.last_spawn_at {
                data.state
                    .last_spawn
                    .insert((schedule.server.clone(), schedule.event_key.clone()), at);
            }
        }
        data.spawn_schedules = seed.spawn_schedules;
        for position in seed.positions {
            data.positions
                .insert((position.server.clone(), position.position_type.to_lowercase()), position);
        }

        Self {
            data: RwLock::new(data),
            snapshot: None,
        }
    }

    /// Mirrors mutable records to `path`, first loading it if it exists.
    pub async fn with_snapshot(mut self, path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: MutableState = bincode::deserialize(&bytes)?;
                info!(
                    "Loaded snapshot {}: {} kit tasks, {} zones",
                    path.display(),
                    state.kit_tasks.len(),
                    state.zones.len()
                );
                self.data.get_mut().state = state;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        self.snapshot = Some(path);
        Ok(self)
    }

    async fn persist(&self, state: &MutableState) -> StoreResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let bytes = bincode::serialize(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Wrote snapshot of {} bytes", bytes.len());
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut MutableState) + Send,
    {
        let mut data = self.data.write().await;
        f(&mut data.state);
        self.persist(&data.state).await
    }

    /// Like `mutate`, but refuses to add records for a purged server.
    async fn insert_for<F>(&self, server: &ServerId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut MutableState) + Send,
    {
        let mut data = self.data.write().await;
        if data.removed.contains(server) {
            debug!("Rejected write for removed server {}", server);
            return Err(StoreError::ServerRemoved(server.clone()));
        }
        f(&mut data.state);
        self.persist(&data.state).await
    }

    pub async fn insert_kit_auth(&self, entry: KitAuthEntry) {
        self.data.write().await.kit_auth.insert(entry);
    }

    pub async fn revoke_kit_auth(&self, entry: &KitAuthEntry) -> bool {
        self.data.write().await.kit_auth.remove(entry)
    }

    pub async fn insert_zone_defaults(&self, defaults: ZoneDefaults) {
        self.data
            .write()
            .await
            .zone_defaults
            .insert(defaults.server.clone(), defaults);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn endpoints(&self) -> StoreResult<Vec<ServerEndpoint>> {
        Ok(self.data.read().await.endpoints.values().cloned().collect())
    }

    async fn endpoint(&self, server: &ServerId) -> StoreResult<Option<ServerEndpoint>> {
        Ok(self.data.read().await.endpoints.get(server).cloned())
    }

    async fn put_endpoint(&self, endpoint: ServerEndpoint) -> StoreResult<()> {
        let mut data = self.data.write().await;
        data.removed.remove(&endpoint.id);
        data.endpoints.insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    async fn zone_defaults(&self, server: &ServerId) -> StoreResult<Option<ZoneDefaults>> {
        Ok(self.data.read().await.zone_defaults.get(server).cloned())
    }

    async fn kit_definition(&self, server: &ServerId, kit: &str) -> StoreResult<Option<KitDefinition>> {
        let data = self.data.read().await;
        Ok(data.kits.get(&(server.clone(), kit_key(kit))).cloned())
    }

    async fn kit_authorized(&self, server: &ServerId, list_name: &str, player: &str) -> StoreResult<bool> {
        let entry = KitAuthEntry {
            server: server.clone(),
            list_name: list_name.to_string(),
            player: player.to_string(),
        };
        Ok(self.data.read().await.kit_auth.contains(&entry))
    }

    async fn kit_cooldown(&self, server: &ServerId, player: &str, kit: &str) -> StoreResult<Option<u64>> {
        let key = (server.clone(), player.to_string(), kit_key(kit));
        Ok(self.data.read().await.state.cooldowns.get(&key).copied())
    }

    async fn set_kit_cooldown(&self, server: &ServerId, player: &str, kit: &str, until: u64) -> StoreResult<()> {
        let key = (server.clone(), player.to_string(), kit_key(kit));
        self.insert_for(server, move |state| {
            state.cooldowns.insert(key, until);
        })
        .await
    }

    async fn kit_tasks(&self, server: &ServerId) -> StoreResult<Vec<KitDeliveryTask>> {
        let data = self.data.read().await;
        Ok(data
            .state
            .kit_tasks
            .values()
            .filter(|task| &task.server == server)
            .cloned()
            .collect())
    }

    async fn put_kit_task(&self, task: &KitDeliveryTask) -> StoreResult<()> {
        let key = (task.server.clone(), task.player.clone(), kit_key(&task.kit));
        let server = task.server.clone();
        let task = task.clone();
        self.insert_for(&server, move |state| {
            state.kit_tasks.insert(key, task);
        })
        .await
    }

    async fn remove_kit_task(&self, server: &ServerId, player: &str, kit: &str) -> StoreResult<()> {
        let key = (server.clone(), player.to_string(), kit_key(kit));
        self.mutate(move |state| {
            state.kit_tasks.remove(&key);
        })
        .await
    }

    async fn zones(&self, server: &ServerId) -> StoreResult<Vec<Zone>> {
        let data = self.data.read().await;
        Ok(data
            .state
            .zones
            .values()
            .filter(|zone| &zone.server == server)
            .cloned()
            .collect())
    }

    async fn put_zone(&self, zone: &Zone) -> StoreResult<()> {
        let key = (zone.server.clone(), zone.owner.clone());
        let server = zone.server.clone();
        let zone = zone.clone();
        self.insert_for(&server, move |state| {
            state.zones.insert(key, zone);
        })
        .await
    }

    async fn remove_zone(&self, server: &ServerId, owner: &str) -> StoreResult<()> {
        let key = (server.clone(), owner.to_string());
        self.mutate(move |state| {
            state.zones.remove(&key);
        })
        .await
    }

    async fn spawn_schedules(&self) -> StoreResult<Vec<SpawnSchedule>> {
        let data = self.data.read().await;
        Ok(data
            .spawn_schedules
            .iter()
            .map(|schedule| {
                let mut schedule = schedule.clone();
                schedule.last_spawn_at = data
                    .state
                    .last_spawn
                    .get(&(schedule.server.clone(), schedule.event_key.clone()))
                    .copied();
                schedule
            })
            .collect())
    }

    async fn set_last_spawn(&self, server: &ServerId, event_key: &str, at: u64) -> StoreResult<()> {
        let key = (server.clone(), event_key.to_string());
        self.insert_for(server, move |state| {
            state.last_spawn.insert(key, at);
        })
        .await
    }

    async fn position_schedule(
        &self,
        server: &ServerId,
        position_type: &str,
    ) -> StoreResult<Option<PositionSchedule>> {
        let key = (server.clone(), position_type.to_lowercase());
        Ok(self.data.read().await.positions.get(&key).cloned())
    }

    async fn purge_server(&self, server: &ServerId) -> StoreResult<()> {
        let mut data = self.data.write().await;
        data.endpoints.remove(server);
        data.zone_defaults.remove(server);
        data.kits.retain(|(s, _), _| s != server);
        data.kit_auth.retain(|entry| &entry.server != server);
        data.spawn_schedules.retain(|schedule| &schedule.server != server);
        data.positions.retain(|(s, _), _| s != server);
        data.state.purge(server);
        data.removed.insert(server.clone());
        info!("Purged all records of server {}", server);
        self.persist(&data.state).await
    }
}
