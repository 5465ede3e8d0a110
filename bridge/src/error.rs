//! Error types for the bridge.

use protocol::{CodecError, ServerId};
use std::time::Duration;
use thiserror::Error;

/// Why a command sent to a game server did not produce a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("connection to {0} is unavailable")]
    ConnectionUnavailable(ServerId),

    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("server {0} rejected the rcon password")]
    AuthRejected(ServerId),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("bridge is shutting down")]
    Shutdown,
}

/// Why a connection session ended.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    #[error("server closed the connection")]
    Closed,

    #[error("connect timed out")]
    ConnectTimedOut,

    #[error("authentication timed out")]
    AuthTimedOut,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("liveness probe timed out")]
    ProbeTimedOut,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Errors that must not be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::AuthRejected)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("server {0} was removed")]
    ServerRemoved(ServerId),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("server {0} is already registered")]
    AlreadyRegistered(ServerId),

    #[error("server {0} is not registered")]
    UnknownServer(ServerId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid config file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
