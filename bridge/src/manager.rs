//! Registry of game server connections
//!
//! This module owns one connection task per registered endpoint and is the
//! single entry point subsystems use to run console commands:
//! - Endpoint lifecycle (register, unregister, shutdown)
//! - Command routing to the right connection by server id
//! - Status reporting for operators
//!
//! Removing an endpoint stops its connection, fails its in-flight command,
//! tells every subsystem to forget the server, and purges its records.

use async_trait::async_trait;
use log::{info, warn};
use protocol::ServerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::ConnectionConfig;
use crate::connection::{CommandSender, ConnectionHandle, ConnectionState};
use crate::error::{BridgeError, CommandError, Result};
use crate::model::{ServerEndpoint, TenantId};
use crate::notify::Notifier;
use crate::router::EventRouter;
use crate::store::Store;

/// Anything that can run a console command on a server
///
/// Subsystems depend on this rather than on [`ConnectionManager`] directly,
/// which lets their tests script responses.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(
        &self,
        server: &ServerId,
        text: &str,
        timeout: Duration,
    ) -> std::result::Result<String, CommandError>;
}

/// Snapshot of one endpoint's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub server: ServerId,
    pub tenant: TenantId,
    pub address: String,
    pub state: ConnectionState,
    pub auth_rejected: bool,
}

struct Registered {
    endpoint: ServerEndpoint,
    handle: ConnectionHandle,
}

/// Manages all game server connections
///
/// Connections are indexed by server id. Each runs independently; a slow or
/// failing server never delays commands bound for another one.
pub struct ConnectionManager {
    /// Live connections indexed by server id
    connections: RwLock<HashMap<ServerId, Registered>>,
    /// Settings applied to every new connection
    config: ConnectionConfig,
    /// Where connections publish parsed console events
    router: Arc<EventRouter>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn Store>,
}

impl ConnectionManager {
    /// Creates an empty manager
    ///
    /// No connections are opened until endpoints are added, either one by
    /// one or all at once from the store with [`Self::load_endpoints`].
    pub fn new(
        config: ConnectionConfig,
        router: Arc<EventRouter>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            config,
            router,
            notifier,
            store,
        }
    }

    /// Registers every endpoint the store knows about
    ///
    /// Returns how many were started. Endpoints that are already registered
    /// are skipped.
    pub async fn load_endpoints(&self) -> Result<usize> {
        let mut started = 0;
        for endpoint in self.store.endpoints().await? {
            match self.start(endpoint).await {
                Ok(()) => started += 1,
                Err(BridgeError::AlreadyRegistered(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    /// Registers a new endpoint and starts connecting to it
    ///
    /// The endpoint is also written to the store so subsystems can resolve
    /// its tenant. Fails if the server id is already registered.
    pub async fn add_endpoint(&self, endpoint: ServerEndpoint) -> Result<()> {
        if self.connections.read().await.contains_key(&endpoint.id) {
            return Err(BridgeError::AlreadyRegistered(endpoint.id));
        }
        self.store.put_endpoint(endpoint.clone()).await?;
        self.start(endpoint).await
    }

    async fn start(&self, endpoint: ServerEndpoint) -> Result<()> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&endpoint.id) {
            return Err(BridgeError::AlreadyRegistered(endpoint.id));
        }

        info!(
            "Registering server {} ({}) for tenant {}",
            endpoint.id,
            endpoint.address(),
            endpoint.tenant
        );
        let handle = ConnectionHandle::spawn(
            endpoint.clone(),
            self.config.clone(),
            self.router.clone(),
            self.notifier.clone(),
        );
        let server = endpoint.id.clone();
        connections.insert(server.clone(), Registered { endpoint, handle });
        drop(connections);

        self.router.server_added(&server);
        Ok(())
    }

    /// Unregisters an endpoint
    ///
    /// Closes the connection (failing its in-flight command), tells every
    /// subsystem to drop the server's state, and purges its records from the
    /// store. A handler that was still finishing a command when the
    /// connection closed cannot write the records back: the store rejects
    /// writes for a purged server. Returns false if the server was not
    /// registered.
    pub async fn remove_endpoint(&self, server: &ServerId) -> Result<bool> {
        let registered = self.connections.write().await.remove(server);
        let Some(registered) = registered else {
            return Ok(false);
        };

        registered.handle.close().await;
        self.router.server_removed(server);
        self.store.purge_server(server).await?;
        info!("Server {} unregistered", server);
        Ok(true)
    }

    /// Runs `text` on `server` and returns the complete response
    ///
    /// Fails immediately with `ConnectionUnavailable` if the server is not
    /// registered or its connection is not READY.
    pub async fn send(
        &self,
        server: &ServerId,
        text: &str,
        timeout: Duration,
    ) -> std::result::Result<String, CommandError> {
        let sender = self.sender(server).await;
        match sender {
            Some(sender) => sender.send(text, timeout).await,
            None => Err(CommandError::ConnectionUnavailable(server.clone())),
        }
    }

    /// Command handle for one server, usable without holding the registry lock
    pub async fn sender(&self, server: &ServerId) -> Option<CommandSender> {
        self.connections
            .read()
            .await
            .get(server)
            .map(|registered| registered.handle.sender())
    }

    pub async fn state(&self, server: &ServerId) -> Option<ConnectionState> {
        self.connections
            .read()
            .await
            .get(server)
            .map(|registered| registered.handle.state())
    }

    /// Status of every registered endpoint, ordered by server id
    pub async fn status(&self) -> Vec<EndpointStatus> {
        let connections = self.connections.read().await;
        let mut status: Vec<EndpointStatus> = connections
            .values()
            .map(|registered| EndpointStatus {
                server: registered.endpoint.id.clone(),
                tenant: registered.endpoint.tenant.clone(),
                address: registered.endpoint.address(),
                state: registered.handle.state(),
                auth_rejected: registered.handle.is_auth_rejected(),
            })
            .collect();
        status.sort_by(|a, b| a.server.cmp(&b.server));
        status
    }

    pub async fn servers(&self) -> Vec<ServerId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Returns the number of registered endpoints
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns true if no endpoints are registered
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Closes every connection
    ///
    /// In-flight and queued commands fail fast with `Shutdown`. Records are
    /// kept so the next start resumes where this one stopped.
    pub async fn shutdown(&self) {
        let drained: Vec<Registered> = self.connections.write().await.drain().map(|(_, r)| r).collect();
        if drained.is_empty() {
            return;
        }

        info!("Closing {} connections", drained.len());
        let closing: Vec<_> = drained
            .into_iter()
            .map(|registered| tokio::spawn(registered.handle.close()))
            .collect();
        for task in closing {
            if let Err(e) = task.await {
                warn!("Connection close task failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl CommandSink for ConnectionManager {
    async fn send_command(
        &self,
        server: &ServerId,
        text: &str,
        timeout: Duration,
    ) -> std::result::Result<String, CommandError> {
        self.send(server, text, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::router::RouterMessage;
    use crate::store::MemoryStore;

    fn endpoint(id: &str) -> ServerEndpoint {
        ServerEndpoint {
            id: ServerId::new(id),
            tenant: TenantId::new("guild"),
            host: "127.0.0.1".into(),
            port: 1,
            password: "pw".into(),
        }
    }

    fn manager(router: Arc<EventRouter>) -> ConnectionManager {
        ConnectionManager::new(
            ConnectionConfig::default(),
            router,
            Arc::new(LogNotifier),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_add_and_remove_endpoint() {
        let router = Arc::new(EventRouter::new(16));
        let mut events = router.subscribe("test");
        let manager = manager(router.clone());

        assert!(manager.is_empty().await);
        manager.add_endpoint(endpoint("eu-1")).await.unwrap();
        assert_eq!(manager.len().await, 1);
        assert!(matches!(
            events.recv().await,
            Some(RouterMessage::ServerAdded(ref s)) if s.as_str() == "eu-1"
        ));

        assert!(manager.remove_endpoint(&ServerId::new("eu-1")).await.unwrap());
        assert!(!manager.remove_endpoint(&ServerId::new("eu-1")).await.unwrap());
        assert!(manager.is_empty().await);
        assert!(matches!(
            events.recv().await,
            Some(RouterMessage::ServerRemoved(ref s)) if s.as_str() == "eu-1"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_rejected() {
        let manager = manager(Arc::new(EventRouter::new(16)));
        manager.add_endpoint(endpoint("eu-1")).await.unwrap();

        let err = manager.add_endpoint(endpoint("eu-1")).await.unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyRegistered(_)));

        manager.shutdown().await;
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_server_is_unavailable() {
        let manager = manager(Arc::new(EventRouter::new(16)));
        let err = manager
            .send(&ServerId::new("nope"), "status", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::ConnectionUnavailable(ServerId::new("nope")));
        assert!(manager.state(&ServerId::new("nope")).await.is_none());
    }

    #[tokio::test]
    async fn test_status_lists_endpoints_in_order() {
        let manager = manager(Arc::new(EventRouter::new(16)));
        manager.add_endpoint(endpoint("b")).await.unwrap();
        manager.add_endpoint(endpoint("a")).await.unwrap();

        let status = manager.status().await;
        let ids: Vec<&str> = status.iter().map(|s| s.server.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(status.iter().all(|s| !s.auth_rejected && s.state != ConnectionState::Ready));

        manager.shutdown().await;
    }
}
