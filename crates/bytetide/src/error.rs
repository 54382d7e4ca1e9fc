use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{node::NodeMsg, peer::PeerMsg, wire::Message};

impl From<mpsc::error::SendError<NodeMsg>> for Error {
    fn from(value: mpsc::error::SendError<NodeMsg>) -> Self {
        Self::SendNodeError(value.to_string())
    }
}

impl From<mpsc::error::SendError<PeerMsg>> for Error {
    fn from(value: mpsc::error::SendError<PeerMsg>) -> Self {
        Self::SendPeerError(value.to_string())
    }
}

impl From<mpsc::error::SendError<Message>> for Error {
    fn from(value: mpsc::error::SendError<Message>) -> Self {
        Self::SendPeerError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not parse the manifest: {0}")]
    ManifestParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not parse the configuration file")]
    ConfigParse(#[from] toml::de::Error),

    #[error("The storage directory is not usable: {0}")]
    StorageDirectory(PathBuf),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error")]
    Io(#[from] io::Error),

    #[error("Could not open the file: {0}")]
    FileOpen(PathBuf),

    #[error("Could not bind the listener to {0}")]
    Bind(SocketAddr, #[source] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("The peer sent an invalid handshake")]
    HandshakeInvalid,

    #[error("The peer did not complete the handshake in time")]
    HandshakeTimeout,

    #[error("The peer registry is full, capacity is {0}")]
    CapacityExceeded(usize),

    #[error("Not connected to {0}")]
    PeerNotFound(SocketAddr),

    #[error("Already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("Refusing to connect to our own listener")]
    SelfConnect,

    #[error("Merkle query returned nothing: {0}")]
    Query(&'static str),

    #[error("The package is not managed by this node")]
    PackageNotFound,

    #[error("The chunk hash does not belong to the package")]
    ChunkNotFound,

    #[error("A package with the same identifier is already managed")]
    PackageExists,

    #[error("The node was stopped")]
    Cancelled,

    #[error("Could not send message to Node: {0}")]
    SendNodeError(String),

    #[error("Could not send message to Peer: {0}")]
    SendPeerError(String),

    #[error("The blocking task panicked or was cancelled")]
    JoinError(#[from] tokio::task::JoinError),
}

impl Error {
    /// Process exit code for failures that stop the node before it starts.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigParse(_) | Error::Io(_) => 1,
            Error::Config(_) => 2,
            Error::StorageDirectory(_) => 3,
            Error::Bind(..) => 4,
            _ => 1,
        }
    }
}
