//! One RCON session per registered server.
//!
//! Each endpoint gets a long-lived task that owns the socket and walks
//! DISCONNECTED -> CONNECTING -> AUTHENTICATING -> READY, falling back to
//! DISCONNECTED with exponential backoff whenever the session breaks. Callers
//! talk to it through a [`CommandSender`]; commands are only accepted while
//! the connection is READY and are otherwise rejected immediately.
//!
//! A rejected password is terminal: the task stops, the operator is
//! notified, and every later command fails with `AuthRejected`.

use bytes::BytesMut;
use log::{debug, error, info, warn};
use protocol::{
    encode, encode_to_vec, get_timestamp, Direction, EventParser, FrameDecoder, Packet, PacketType,
    ServerId, MAX_SERVER_BODY,
};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::correlator::{CommandRequest, Correlator, Routed};
use crate::error::{CommandError, ConnectionError};
use crate::model::ServerEndpoint;
use crate::notify::{Notice, Notification, Notifier};
use crate::router::EventRouter;
use crate::timer::sleep_until_deadline;

/// Request id the server answers with when the password is wrong.
const AUTH_REJECTED_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

/// Cheap, cloneable handle for issuing commands on one connection.
#[derive(Debug, Clone)]
pub struct CommandSender {
    server: ServerId,
    requests: mpsc::Sender<CommandRequest>,
    state: watch::Receiver<ConnectionState>,
    auth_rejected: Arc<AtomicBool>,
}

impl CommandSender {
    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_auth_rejected(&self) -> bool {
        self.auth_rejected.load(Ordering::Acquire)
    }

    /// Sends `text` and waits for its complete response.
    pub async fn send(&self, text: &str, limit: Duration) -> Result<String, CommandError> {
        if self.is_auth_rejected() {
            return Err(CommandError::AuthRejected(self.server.clone()));
        }
        if self.state() != ConnectionState::Ready {
            return Err(CommandError::ConnectionUnavailable(self.server.clone()));
        }

        let (request, response) = CommandRequest::new(text, limit);
        let deadline = request.deadline;
        match timeout_at(deadline, self.requests.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(CommandError::ConnectionUnavailable(self.server.clone())),
            Err(_) => return Err(CommandError::TimedOut(limit)),
        }

        // Commands queued behind a slow one still time out on schedule; the
        // connection skips them once their deadline has passed.
        match timeout_at(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::ConnectionUnavailable(self.server.clone())),
            Err(_) => Err(CommandError::TimedOut(limit)),
        }
    }
}

/// Owner's handle on a connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    sender: CommandSender,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Starts the connection task for `endpoint`.
    pub fn spawn(
        endpoint: ServerEndpoint,
        config: ConnectionConfig,
        router: Arc<EventRouter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(config.command_queue.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let auth_rejected = Arc::new(AtomicBool::new(false));

        let sender = CommandSender {
            server: endpoint.id.clone(),
            requests: request_tx,
            state: state_rx,
            auth_rejected: auth_rejected.clone(),
        };

        let connection = Connection {
            parser: EventParser::new(endpoint.id.clone(), MAX_SERVER_BODY, config.emit_generic_events),
            backoff: Backoff::from_config(&config),
            endpoint,
            config,
            requests: request_rx,
            state: state_tx,
            router,
            notifier,
            auth_rejected,
        };
        let task = tokio::spawn(connection.run(shutdown_rx));

        Self {
            sender,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.sender.state()
    }

    pub fn is_auth_rejected(&self) -> bool {
        self.sender.is_auth_rejected()
    }

    /// Watches state changes, e.g. to wait for READY.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.sender.state.clone()
    }

    /// Stops the task, failing anything in flight or queued.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("{}: connection task failed: {}", self.sender.server, e);
        }
    }
}

struct Connection {
    endpoint: ServerEndpoint,
    config: ConnectionConfig,
    requests: mpsc::Receiver<CommandRequest>,
    state: watch::Sender<ConnectionState>,
    router: Arc<EventRouter>,
    notifier: Arc<dyn Notifier>,
    parser: EventParser,
    backoff: Backoff,
    auth_rejected: Arc<AtomicBool>,
}

/// Runs `fut` unless shutdown is signalled first.
async fn until_shutdown<F: Future>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        output = fut => Some(output),
        _ = shutdown.changed() => None,
    }
}

impl Connection {
    fn server(&self) -> ServerId {
        self.endpoint.id.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.endpoint.id, previous, state);
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("{}: connection task started for {}", self.endpoint.id, self.endpoint.address());
        let mut final_error = CommandError::Shutdown;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.session(&mut shutdown).await {
                Ok(()) => break,
                Err(err) if err.is_fatal() => {
                    error!("{}: {}, not retrying", self.endpoint.id, err);
                    self.auth_rejected.store(true, Ordering::Release);
                    self.notifier.notify(Notification::new(
                        self.endpoint.tenant.clone(),
                        self.server(),
                        Notice::AuthRejected,
                    ));
                    final_error = CommandError::AuthRejected(self.server());
                    break;
                }
                Err(err) => warn!("{}: session ended: {}", self.endpoint.id, err),
            }

            self.parser.reset();
            self.set_state(ConnectionState::Disconnected);
            self.drain_requests(CommandError::ConnectionUnavailable(self.server()));

            let delay = self.backoff.next_delay();
            info!(
                "{}: reconnecting in {:?} (attempt {})",
                self.endpoint.id,
                delay,
                self.backoff.attempts()
            );
            if self.wait(delay, &mut shutdown).await {
                break;
            }
        }

        self.set_state(ConnectionState::Closing);
        self.requests.close();
        self.drain_requests(final_error);
        self.set_state(ConnectionState::Disconnected);
        info!("{}: connection task stopped", self.endpoint.id);
    }

    fn drain_requests(&mut self, err: CommandError) {
        while let Ok(request) = self.requests.try_recv() {
            request.fail(err.clone());
        }
    }

    /// Backoff wait. Rejects commands that arrive meanwhile. Returns true on
    /// shutdown.
    async fn wait(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                _ = shutdown.changed() => return true,
                request = self.requests.recv() => match request {
                    Some(request) => request.fail(CommandError::ConnectionUnavailable(self.server())),
                    None => return true,
                },
            }
        }
    }

    /// One connect-authenticate-serve cycle. `Ok` means shutdown.
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        let address = self.endpoint.address();
        let connect = timeout(self.config.connect_timeout(), TcpStream::connect(address));
        let mut stream = match until_shutdown(shutdown, connect).await {
            None => return Ok(()),
            Some(result) => result.map_err(|_| ConnectionError::ConnectTimedOut)??,
        };
        stream.set_nodelay(true)?;

        self.set_state(ConnectionState::Authenticating);
        let mut decoder = FrameDecoder::new(Direction::FromServer).max_size(self.config.max_frame_size);
        let auth_id = rand::thread_rng().gen_range(1..i32::MAX / 2);
        let auth = timeout(
            self.config.auth_timeout(),
            authenticate(&mut stream, &mut decoder, auth_id, &self.endpoint.password),
        );
        match until_shutdown(shutdown, auth).await {
            None => return Ok(()),
            Some(result) => result.map_err(|_| ConnectionError::AuthTimedOut)??,
        }

        info!("{}: authenticated, connection ready", self.endpoint.id);
        self.set_state(ConnectionState::Ready);
        let ready_since = Instant::now();

        let result = self.serve(stream, decoder, shutdown).await;

        if self.backoff.session_ended(ready_since.elapsed()) {
            debug!("{}: session was stable, backoff reset", self.endpoint.id);
        }
        result
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        mut decoder: FrameDecoder,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let (mut reader, mut writer) = stream.into_split();
        let first_id = rand::thread_rng().gen_range(1..i32::MAX / 2);
        let mut correlator = Correlator::new(self.server(), first_id, self.config.multi_part_responses);

        let result = match self.drain_frames(&mut decoder, &mut correlator) {
            Ok(()) => {
                self.serve_loop(&mut reader, &mut writer, &mut decoder, &mut correlator, shutdown)
                    .await
            }
            Err(e) => Err(e),
        };

        self.set_state(ConnectionState::Disconnected);
        match &result {
            Ok(()) => correlator.fail(CommandError::Shutdown),
            Err(_) => correlator.fail(CommandError::ConnectionUnavailable(self.server())),
        }
        let _ = writer.shutdown().await;
        result
    }

    async fn serve_loop(
        &mut self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        decoder: &mut FrameDecoder,
        correlator: &mut Correlator,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let keepalive = self.config.keepalive_idle();
        let mut last_activity = Instant::now();

        loop {
            let deadline = correlator.deadline();
            let probe_at = keepalive.map(|idle| last_activity + idle);
            let idle = correlator.is_idle();

            tokio::select! {
                biased;

                _ = shutdown.changed() => return Ok(()),

                read = reader.read_buf(decoder.buffer_mut()) => {
                    if read? == 0 {
                        return Err(ConnectionError::Closed);
                    }
                    last_activity = Instant::now();
                    self.drain_frames(decoder, correlator)?;
                }

                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    if let Some(expired) = correlator.expire(Instant::now()) {
                        if expired.probe {
                            return Err(ConnectionError::ProbeTimedOut);
                        }
                    }
                }

                request = self.requests.recv(), if idle => {
                    match request {
                        Some(request) => self.dispatch(writer, correlator, request).await?,
                        None => return Ok(()),
                    }
                }

                _ = sleep_until_deadline(probe_at), if idle && probe_at.is_some() => {
                    debug!("{}: idle, sending liveness probe", self.endpoint.id);
                    let probe = CommandRequest::probe(
                        self.config.keepalive_command.clone(),
                        self.config.command_timeout(),
                    );
                    self.dispatch(writer, correlator, probe).await?;
                    last_activity = Instant::now();
                }
            }
        }
    }

    async fn dispatch(
        &self,
        writer: &mut OwnedWriteHalf,
        correlator: &mut Correlator,
        request: CommandRequest,
    ) -> Result<(), ConnectionError> {
        match correlator.begin(request, Instant::now()) {
            Ok(packets) => {
                // Command and sentinel go out in one write.
                let mut frames = BytesMut::new();
                for packet in &packets {
                    encode(packet, &mut frames)?;
                }
                writer.write_all_buf(&mut frames).await?;
            }
            Err(request) => request.fail(CommandError::ConnectionUnavailable(self.server())),
        }
        Ok(())
    }

    fn drain_frames(
        &mut self,
        decoder: &mut FrameDecoder,
        correlator: &mut Correlator,
    ) -> Result<(), ConnectionError> {
        while let Some(packet) = decoder.next_packet()? {
            match correlator.on_packet(packet) {
                Routed::Console(body) => {
                    for event in self.parser.push_frame(&body, get_timestamp()) {
                        self.router.publish(event);
                    }
                }
                Routed::Late { id } => {
                    debug!("{}: dropping frame for unknown request id {}", self.endpoint.id, id);
                }
                Routed::Completed | Routed::Partial => {}
            }
        }
        Ok(())
    }
}

/// Sends the password and waits for the server's verdict.
///
/// Servers send an empty `ResponseValue` ahead of the `AuthResponse`; any
/// frames other than the verdict are skipped. Frames received after the
/// verdict stay in `decoder`.
pub async fn authenticate<S>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    auth_id: i32,
    password: &str,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = encode_to_vec(&Packet::auth(auth_id, password))?;
    stream.write_all(&frame).await?;

    loop {
        while let Some(packet) = decoder.next_packet()? {
            match packet.kind {
                PacketType::AuthResponse if packet.id == AUTH_REJECTED_ID => {
                    return Err(ConnectionError::AuthRejected);
                }
                PacketType::AuthResponse if packet.id == auth_id => return Ok(()),
                PacketType::AuthResponse => {
                    return Err(ConnectionError::Protocol(format!(
                        "auth response for id {}, expected {}",
                        packet.id, auth_id
                    )));
                }
                other => debug!("Skipping {:?} frame {} during authentication", other, packet.id),
            }
        }

        if stream.read_buf(decoder.buffer_mut()).await? == 0 {
            return Err(ConnectionError::Closed);
        }
    }
}
