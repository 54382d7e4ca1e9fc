//! Bounded set of active peers.
use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{spawn, sync::Mutex, task::JoinHandle};
use tracing::debug;

use crate::error::Error;

use super::{PeerCtx, PeerId};

/// A registered peer and the task running its handler.
#[derive(Debug)]
pub struct PeerEntry {
    pub ctx: Arc<PeerCtx>,
    pub handle: JoinHandle<()>,
}

/// All peers a node is connected to, at most `capacity` of them.
///
/// Every operation takes the same lock, so admission is all or nothing.
/// Removal swaps the last entry into the freed slot, the order of
/// [`PeerRegistry::peers`] is not stable across removals.
#[derive(Debug)]
pub struct PeerRegistry {
    capacity: usize,
    peers: Mutex<Vec<PeerEntry>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            peers: Mutex::new(Vec::with_capacity(capacity)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn next_id(&self) -> PeerId {
        PeerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Admit a peer and spawn its handler.
    ///
    /// The handler is only spawned once the peer is admitted, a rejected
    /// `task` is dropped without running.
    pub async fn add<F>(&self, ctx: Arc<PeerCtx>, task: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut peers = self.peers.lock().await;

        if peers.len() >= self.capacity {
            debug!("{} rejected, registry is full", ctx.remote_addr);
            return Err(Error::CapacityExceeded(self.capacity));
        }
        if peers.iter().any(|p| p.ctx.remote_addr == ctx.remote_addr) {
            return Err(Error::AlreadyConnected(ctx.remote_addr));
        }

        let handle = spawn(task);
        debug!("{} admitted as {}", ctx.remote_addr, ctx.id);
        peers.push(PeerEntry { ctx, handle });

        Ok(())
    }

    /// Remove a peer, the last entry takes its place.
    pub async fn remove(&self, id: PeerId) -> Option<PeerEntry> {
        let mut peers = self.peers.lock().await;
        let i = peers.iter().position(|p| p.ctx.id == id)?;
        Some(peers.swap_remove(i))
    }

    pub async fn find_by_address(
        &self,
        addr: SocketAddr,
    ) -> Option<Arc<PeerCtx>> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .find(|p| p.ctx.remote_addr == addr)
            .map(|p| p.ctx.clone())
    }

    pub async fn is_admitted(&self, addr: SocketAddr) -> bool {
        self.find_by_address(addr).await.is_some()
    }

    /// Slot of a peer in the registry.
    pub async fn position(&self, id: PeerId) -> Option<usize> {
        let peers = self.peers.lock().await;
        peers.iter().position(|p| p.ctx.id == id)
    }

    /// Snapshot of the registered peers, in slot order.
    pub async fn peers(&self) -> Vec<Arc<PeerCtx>> {
        let peers = self.peers.lock().await;
        peers.iter().map(|p| p.ctx.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Empty the registry, handing back every entry so the caller can join
    /// the handlers.
    pub async fn drain(&self) -> Vec<PeerEntry> {
        let mut peers = self.peers.lock().await;
        peers.drain(..).collect()
    }
}
