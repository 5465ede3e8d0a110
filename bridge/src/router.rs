//! Fan-out of domain events to subsystems.
//!
//! Every subscriber holds a receiver on one bounded broadcast channel.
//! Publishing never blocks: a subscriber that falls more than the channel
//! capacity behind loses its oldest messages, and the loss is counted the
//! next time it receives. One slow subsystem therefore cannot stall the
//! connection that produced the event or any other subscriber. Per-server
//! order is preserved for every subscriber.
//!
//! Channel capacity is rounded up to a power of two.

use log::{debug, warn};
use protocol::{DomainEvent, ServerId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

/// Message delivered to subscribers.
#[derive(Debug, Clone)]
pub enum RouterMessage {
    Event(Arc<DomainEvent>),
    /// A server was registered; subsystems may start tracking it.
    ServerAdded(ServerId),
    /// A server was unregistered; subsystems must drop its state.
    ServerRemoved(ServerId),
}

impl RouterMessage {
    pub fn server(&self) -> &ServerId {
        match self {
            RouterMessage::Event(event) => &event.server,
            RouterMessage::ServerAdded(server) | RouterMessage::ServerRemoved(server) => server,
        }
    }
}

#[derive(Debug)]
struct Counters {
    name: String,
    dropped: AtomicU64,
    active: AtomicBool,
}

/// Shed count of one live subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStats {
    pub name: String,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct EventRouter {
    /// `None` once closed.
    sender: RwLock<Option<broadcast::Sender<RouterMessage>>>,
    subscribers: RwLock<Vec<Arc<Counters>>>,
    published: AtomicU64,
}

impl EventRouter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber. It sees only messages published afterwards.
    ///
    /// Subscribing to a closed router yields a subscription that is already
    /// at its end.
    pub fn subscribe(&self, name: &str) -> Subscription {
        let receiver = match &*self.sender.read().unwrap_or_else(|e| e.into_inner()) {
            Some(sender) => sender.subscribe(),
            None => {
                let (closed, receiver) = broadcast::channel(1);
                drop(closed);
                receiver
            }
        };

        let counters = Arc::new(Counters {
            name: name.to_string(),
            dropped: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|c| c.active.load(Ordering::Acquire));
        subscribers.push(counters.clone());
        debug!("Subscriber '{}' registered", name);

        Subscription { receiver, counters }
    }

    pub fn publish(&self, event: DomainEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.broadcast(RouterMessage::Event(Arc::new(event)));
    }

    pub fn server_added(&self, server: &ServerId) {
        self.broadcast(RouterMessage::ServerAdded(server.clone()));
    }

    pub fn server_removed(&self, server: &ServerId) {
        self.broadcast(RouterMessage::ServerRemoved(server.clone()));
    }

    fn broadcast(&self, message: RouterMessage) {
        if let Some(sender) = &*self.sender.read().unwrap_or_else(|e| e.into_inner()) {
            // Err only means nobody is subscribed.
            let _ = sender.send(message);
        }
    }

    /// Total events published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.active.load(Ordering::Acquire))
            .map(|c| SubscriberStats {
                name: c.name.clone(),
                dropped: c.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Closes the router; receivers drain what is buffered and then see `None`.
    pub fn close(&self) {
        self.sender.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Receiving end of one subscriber.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<RouterMessage>,
    counters: Arc<Counters>,
}

impl Subscription {
    /// Next message, or `None` once the router is closed and drained.
    pub async fn recv(&mut self) -> Option<RouterMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(missed)) => {
                    let total = self.counters.dropped.fetch_add(missed, Ordering::Relaxed) + missed;
                    warn!(
                        "Subscriber '{}' lagged, shed {} oldest messages ({} so far)",
                        self.counters.name, missed, total
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.counters.name
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.counters.active.store(false, Ordering::Release);
    }
}
