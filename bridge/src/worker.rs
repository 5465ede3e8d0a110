//! Per-server workers for subsystems.
//!
//! A dispatcher drains one router subscription and hands each message to the
//! worker task of the server it concerns, starting workers on demand. A
//! worker processes its server's events strictly in order, so subsystem
//! state for one server never needs a lock, while servers proceed in
//! parallel. Workers also wake for their handler's next deadline and on a
//! periodic sweep.
//!
//! Each worker is fed through its own bounded broadcast channel, so a worker
//! that falls behind sheds its oldest events instead of stalling the
//! dispatcher.

use async_trait::async_trait;
use log::{debug, info, warn};
use protocol::{DomainEvent, ServerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::router::{RouterMessage, Subscription};
use crate::timer::sleep_until_deadline;

/// Subsystem logic for one server.
#[async_trait]
pub trait ServerHandler: Send + 'static {
    /// Loads persisted state. Called once before anything else.
    async fn start(&mut self) {}

    async fn handle_event(&mut self, event: &DomainEvent);

    /// Earliest time [`ServerHandler::on_deadline`] should run.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    async fn on_deadline(&mut self, _now: Instant) {}

    /// Periodic reconciliation.
    async fn sweep(&mut self) {}

    /// The server was unregistered; forget everything about it.
    async fn discard(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub queue_capacity: usize,
    pub sweep_interval: Duration,
}

struct Worker {
    events: broadcast::Sender<RouterMessage>,
    task: JoinHandle<()>,
}

/// Starts a dispatcher for `subscription`.
///
/// `factory` builds the handler for a server the first time the server is
/// seen. Workers for `initial` servers start right away so persisted state
/// is resumed even before any event arrives.
pub fn spawn_dispatcher<H, F>(
    subscription: Subscription,
    factory: F,
    settings: WorkerSettings,
    initial: Vec<ServerId>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    H: ServerHandler,
    F: Fn(ServerId) -> H + Send + Sync + 'static,
{
    tokio::spawn(dispatch(subscription, factory, settings, initial, shutdown))
}

async fn dispatch<H, F>(
    mut subscription: Subscription,
    factory: F,
    settings: WorkerSettings,
    initial: Vec<ServerId>,
    mut shutdown: watch::Receiver<bool>,
) where
    H: ServerHandler,
    F: Fn(ServerId) -> H + Send + Sync + 'static,
{
    let mut workers: HashMap<ServerId, Worker> = HashMap::new();
    for server in initial {
        let worker = start_worker(&factory, server.clone(), &settings, shutdown.clone());
        workers.insert(server, worker);
    }

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        match message {
            RouterMessage::ServerRemoved(server) => {
                // The worker finishes its backlog and exits on its own.
                if let Some(worker) = workers.remove(&server) {
                    let _ = worker.events.send(RouterMessage::ServerRemoved(server));
                }
            }
            message => {
                let server = message.server().clone();
                let worker = workers.entry(server.clone()).or_insert_with(|| {
                    start_worker(&factory, server.clone(), &settings, shutdown.clone())
                });
                if let RouterMessage::Event(_) = message {
                    if worker.events.send(message).is_err() {
                        debug!("{}: worker for {} has stopped", settings.name, server);
                    }
                }
            }
        }
    }

    debug!("{}: dispatcher stopping {} workers", settings.name, workers.len());
    for (server, worker) in workers {
        drop(worker.events);
        if let Err(e) = worker.task.await {
            warn!("{}: worker for {} failed: {}", settings.name, server, e);
        }
    }
}

fn start_worker<H, F>(
    factory: &F,
    server: ServerId,
    settings: &WorkerSettings,
    shutdown: watch::Receiver<bool>,
) -> Worker
where
    H: ServerHandler,
    F: Fn(ServerId) -> H,
{
    info!("{}: starting worker for {}", settings.name, server);
    let (events, receiver) = broadcast::channel(settings.queue_capacity.max(1));
    let label = format!("{}/{}", settings.name, server);
    let handler = factory(server);
    let task = tokio::spawn(run_worker(handler, receiver, label, settings.sweep_interval, shutdown));
    Worker { events, task }
}

async fn run_worker<H: ServerHandler>(
    mut handler: H,
    mut events: broadcast::Receiver<RouterMessage>,
    label: String,
    sweep_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    handler.start().await;

    let sweep_every = sweep_every.max(Duration::from_millis(1));
    let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = handler.next_deadline();
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            message = events.recv() => match message {
                Ok(RouterMessage::Event(event)) => handler.handle_event(&event).await,
                Ok(RouterMessage::ServerRemoved(_)) => {
                    handler.discard().await;
                    return;
                }
                Ok(RouterMessage::ServerAdded(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("{}: worker lagged, shed {} oldest events", label, missed);
                }
                Err(RecvError::Closed) => break,
            },

            _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                handler.on_deadline(Instant::now()).await;
            }

            _ = sweep.tick() => handler.sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::EventRouter;
    use protocol::{EventKind, Presence};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Started(String),
        Event(String, String),
        Deadline(String),
        Swept(String),
        Discarded(String),
    }

    struct Recorder {
        server: ServerId,
        log: Arc<Mutex<Vec<Seen>>>,
        deadline: Option<Instant>,
    }

    #[async_trait]
    impl ServerHandler for Recorder {
        async fn start(&mut self) {
            self.log.lock().unwrap().push(Seen::Started(self.server.to_string()));
        }

        async fn handle_event(&mut self, event: &DomainEvent) {
            let player = event.player().unwrap_or_default().to_string();
            if player == "timer" {
                self.deadline = Some(Instant::now() + Duration::from_secs(5));
            }
            self.log
                .lock()
                .unwrap()
                .push(Seen::Event(self.server.to_string(), player));
        }

        fn next_deadline(&self) -> Option<Instant> {
            self.deadline
        }

        async fn on_deadline(&mut self, _now: Instant) {
            self.deadline = None;
            self.log.lock().unwrap().push(Seen::Deadline(self.server.to_string()));
        }

        async fn sweep(&mut self) {
            self.log.lock().unwrap().push(Seen::Swept(self.server.to_string()));
        }

        async fn discard(&mut self) {
            self.log.lock().unwrap().push(Seen::Discarded(self.server.to_string()));
        }
    }

    fn online(server: &str, player: &str) -> DomainEvent {
        DomainEvent::new(
            ServerId::new(server),
            0,
            EventKind::PlayerPresence {
                player: player.to_string(),
                transition: Presence::Online,
            },
        )
    }

    fn settings(sweep: Duration) -> WorkerSettings {
        WorkerSettings {
            name: "test".into(),
            queue_capacity: 16,
            sweep_interval: sweep,
        }
    }

    fn start(
        router: &EventRouter,
        initial: Vec<ServerId>,
        sweep: Duration,
    ) -> (Arc<Mutex<Vec<Seen>>>, watch::Sender<bool>, JoinHandle<()>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let factory_log = log.clone();
        let task = spawn_dispatcher(
            router.subscribe("test"),
            move |server| Recorder {
                server,
                log: factory_log.clone(),
                deadline: None,
            },
            settings(sweep),
            initial,
            shutdown_rx,
        );
        (log, shutdown_tx, task)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_per_server_workers_in_order() {
        let router = EventRouter::new(16);
        let (log, shutdown, task) = start(&router, vec![], Duration::from_secs(3600));

        router.publish(online("s1", "alice"));
        router.publish(online("s2", "bob"));
        router.publish(online("s1", "carol"));
        settle().await;

        let seen = log.lock().unwrap().clone();
        let s1: Vec<&Seen> = seen
            .iter()
            .filter(|s| matches!(s, Seen::Event(server, _) if server == "s1"))
            .collect();
        assert_eq!(
            s1,
            vec![
                &Seen::Event("s1".into(), "alice".into()),
                &Seen::Event("s1".into(), "carol".into())
            ]
        );
        assert!(seen.contains(&Seen::Started("s2".into())));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_workers_start_and_sweep() {
        let router = EventRouter::new(16);
        let (log, shutdown, task) =
            start(&router, vec![ServerId::new("s1")], Duration::from_secs(60));
        settle().await;
        assert_eq!(log.lock().unwrap().clone(), vec![Seen::Started("s1".into())]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(log.lock().unwrap().contains(&Seen::Swept("s1".into())));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wakes_worker() {
        let router = EventRouter::new(16);
        let (log, shutdown, task) = start(&router, vec![], Duration::from_secs(3600));

        router.publish(online("s1", "timer"));
        settle().await;
        assert!(!log.lock().unwrap().contains(&Seen::Deadline("s1".into())));

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert!(log.lock().unwrap().contains(&Seen::Deadline("s1".into())));

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_removal_discards_worker() {
        let router = EventRouter::new(16);
        let (log, shutdown, task) = start(&router, vec![], Duration::from_secs(3600));

        router.publish(online("s1", "alice"));
        settle().await;
        router.server_removed(&ServerId::new("s1"));
        settle().await;

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.last(), Some(&Seen::Discarded("s1".into())));

        // A later event starts a fresh worker.
        router.publish(online("s1", "bob"));
        settle().await;
        let starts = log
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == Seen::Started("s1".into()))
            .count();
        assert_eq!(starts, 2);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }
}
