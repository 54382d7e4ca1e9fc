use std::{fmt::Display, net::SocketAddr};

use tokio::sync::mpsc;

use crate::{error::Error, wire::Message};

/// Identity of a connection, unique for the lifetime of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(pub(crate) u64);

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Messages used to control the peer handler.
#[derive(Debug)]
pub enum PeerMsg {
    /// Send DSN to the remote and close the connection.
    Disconnect,
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Shared handle to an active peer. The registry keeps one of these per
/// connection, the socket itself belongs to the handler task.
#[derive(Debug)]
pub struct PeerCtx {
    pub id: PeerId,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub tx: mpsc::Sender<PeerMsg>,
    /// Frames waiting for the writer of this connection.
    pub outbox: mpsc::UnboundedSender<Message>,
}

impl PeerCtx {
    /// Queue a frame for the remote. Never waits on the socket.
    pub fn send(&self, msg: Message) -> Result<(), Error> {
        self.outbox.send(msg)?;
        Ok(())
    }
}
