//! In-process RCON server for local testing.
//!
//! Speaks the same framing as a real game server: answers authentication,
//! runs commands through a responder closure, echoes the empty sentinel
//! frame that follows each command, splits long bodies the way a real
//! server does and can push unsolicited console lines to every
//! authenticated client.

use log::{debug, info, warn};
use protocol::{encode_to_vec, Direction, FrameDecoder, Packet, PacketType, MAX_SERVER_BODY};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// How the mock answers one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// One body, split into several frames if it is long.
    Respond(String),
    /// Each part in its own frame.
    Multi(Vec<String>),
    /// No response and no sentinel echo, so the command times out.
    Ignore,
    /// Close the connection without answering.
    Disconnect,
}

pub type Responder = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

#[derive(Debug, Clone)]
enum Control {
    Console(String),
    DropAll,
}

struct Shared {
    password: String,
    responder: Responder,
    commands: Mutex<Vec<String>>,
    accepted: AtomicUsize,
}

pub struct MockRconServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    control: broadcast::Sender<Control>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MockRconServer {
    /// Listens on an ephemeral port of 127.0.0.1.
    pub async fn start<F>(password: &str, responder: F) -> io::Result<Self>
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        Self::bind("127.0.0.1:0", password, responder).await
    }

    pub async fn bind<F>(address: &str, password: &str, responder: F) -> io::Result<Self>
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(address).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            password: password.to_string(),
            responder: Arc::new(responder),
            commands: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        });
        let (control, _) = broadcast::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(listener, shared.clone(), control.clone(), shutdown_rx));
        info!("Mock RCON server listening on {}", addr);

        Ok(Self {
            addr,
            shared,
            control,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Sends `line` as console output to every authenticated client.
    pub fn push_console(&self, line: &str) {
        let _ = self.control.send(Control::Console(line.to_string()));
    }

    /// Closes every open client connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::DropAll);
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Mock RCON accept loop failed: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    control: broadcast::Sender<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                debug!("Mock RCON client connected from {}", peer);
                let client = Client {
                    stream,
                    decoder: FrameDecoder::new(Direction::ToServer),
                    shared: shared.clone(),
                    authenticated: false,
                    swallow_sentinel: false,
                };
                let control = control.subscribe();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.serve(control, shutdown).await {
                        debug!("Mock RCON client {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("Mock RCON accept failed: {}", e),
        }
    }
}

enum Step {
    Read(io::Result<usize>),
    Control(Result<Control, broadcast::error::RecvError>),
    Shutdown,
}

struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    shared: Arc<Shared>,
    authenticated: bool,
    swallow_sentinel: bool,
}

impl Client {
    async fn serve(
        mut self,
        mut control: broadcast::Receiver<Control>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        loop {
            while let Some(packet) = self.decoder.next_packet().map_err(invalid_data)? {
                if !self.handle(packet).await? {
                    return Ok(());
                }
            }

            let step = tokio::select! {
                read = self.stream.read_buf(self.decoder.buffer_mut()) => Step::Read(read),
                message = control.recv() => Step::Control(message),
                _ = shutdown.changed() => Step::Shutdown,
            };

            match step {
                Step::Read(read) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
                Step::Control(Ok(Control::Console(line))) => {
                    if self.authenticated {
                        self.write(&Packet::response(0, line)).await?;
                    }
                }
                Step::Control(Ok(Control::DropAll)) | Step::Shutdown => return Ok(()),
                Step::Control(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Step::Control(Err(broadcast::error::RecvError::Closed)) => return Ok(()),
            }
        }
    }

    /// Returns false when the connection should close.
    async fn handle(&mut self, packet: Packet) -> io::Result<bool> {
        match packet.kind {
            PacketType::Auth => {
                if packet.body == self.shared.password {
                    self.write(&Packet::response(packet.id, "")).await?;
                    self.write(&Packet::new(packet.id, PacketType::AuthResponse, "")).await?;
                    self.authenticated = true;
                    Ok(true)
                } else {
                    self.write(&Packet::new(-1, PacketType::AuthResponse, "")).await?;
                    Ok(false)
                }
            }
            PacketType::ExecCommand if self.authenticated => {
                if let Ok(mut commands) = self.shared.commands.lock() {
                    commands.push(packet.body.clone());
                }
                match (self.shared.responder)(&packet.body) {
                    MockReply::Respond(body) => {
                        for part in split_body(&body, MAX_SERVER_BODY) {
                            self.write(&Packet::response(packet.id, part)).await?;
                        }
                    }
                    MockReply::Multi(parts) => {
                        for part in parts {
                            self.write(&Packet::response(packet.id, part)).await?;
                        }
                    }
                    MockReply::Ignore => self.swallow_sentinel = true,
                    MockReply::Disconnect => return Ok(false),
                }
                Ok(true)
            }
            PacketType::ResponseValue if self.authenticated => {
                if self.swallow_sentinel {
                    self.swallow_sentinel = false;
                } else {
                    self.write(&Packet::response(packet.id, "")).await?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn write(&mut self, packet: &Packet) -> io::Result<()> {
        let frame = encode_to_vec(packet).map_err(invalid_data)?;
        self.stream.write_all(&frame).await
    }
}

fn invalid_data(e: protocol::CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Splits `body` into pieces of at most `max` bytes on char boundaries.
fn split_body(body: &str, max: usize) -> Vec<&str> {
    if body.is_empty() {
        return vec![body];
    }

    let mut parts = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        parts.push(head);
        rest = tail;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_body() {
        assert_eq!(split_body("", 4), vec![""]);
        assert_eq!(split_body("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        // "é" is two bytes and must not be cut in half.
        assert_eq!(split_body("aéb", 2), vec!["a", "é", "b"]);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let server = MockRconServer::start("secret", |_| MockReply::Respond(String::new()))
            .await
            .unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(&encode_to_vec(&Packet::auth(7, "wrong")).unwrap())
            .await
            .unwrap();

        let mut decoder = FrameDecoder::new(Direction::FromServer);
        let packet = loop {
            if let Some(packet) = decoder.next_packet().unwrap() {
                break packet;
            }
            assert!(stream.read_buf(decoder.buffer_mut()).await.unwrap() > 0);
        };
        assert_eq!(packet.kind, PacketType::AuthResponse);
        assert_eq!(packet.id, -1);
        server.stop().await;
    }
}
