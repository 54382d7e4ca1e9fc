//! The node: accepts peers, owns the registries, and executes the commands
//! typed by the user.
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::{Command, Fetch, CHUNK_NOT_IN_PACKAGE},
    config::Config,
    error::Error,
    manifest::{Chunk, Manifest},
    peer::{Direction, Peer, PeerCtx, PeerMsg, PeerRegistry},
    store::{Package, PackageStore},
    wire::{Message, Request},
};

/// Bound of an outbound TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a peer handler gets to say goodbye when it is told to stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A peer-to-peer node.
///
/// The node binds its listener on creation, [`Node::run`] then accepts
/// peers and handles [`NodeMsg`]s until it is told to quit.
pub struct Node {
    pub config: Config,
    pub ctx: Arc<NodeCtx>,
    listener: TcpListener,
    rx: mpsc::Receiver<NodeMsg>,
}

/// State of the [`Node`] shared with peer handlers and the command source.
pub struct NodeCtx {
    pub tx: mpsc::Sender<NodeMsg>,
    pub peers: PeerRegistry,
    pub packages: PackageStore,
    /// Cancelled once, when the node stops. Every loop watches it.
    pub cancel: CancellationToken,
    pub local_addr: SocketAddr,
    /// Where package files are stored.
    pub directory: PathBuf,
}

/// Messages used by the [`Node`] for internal communication.
#[derive(Debug)]
pub enum NodeMsg {
    /// Execute a command, the text to show the user is sent back.
    Command(Command, oneshot::Sender<Option<String>>),
    /// Gracefully shutdown the node.
    Quit,
}

impl Node {
    /// Bind the listener on the configured port.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener =
            TcpListener::bind(addr).await.map_err(|e| Error::Bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel::<NodeMsg>(100);

        let ctx = Arc::new(NodeCtx {
            tx,
            peers: PeerRegistry::new(config.max_peers),
            packages: PackageStore::new(),
            cancel: CancellationToken::new(),
            local_addr,
            directory: config.directory.clone(),
        });

        Ok(Self { config, ctx, listener, rx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr
    }

    /// Accept peers and handle messages until [`NodeMsg::Quit`] arrives or
    /// the cancellation token fires. On the way out every peer gets a DSN
    /// and every handler is joined.
    #[tracing::instrument(skip_all, name = "node")]
    pub async fn run(mut self) -> Result<(), Error> {
        info!("listening on {}", self.ctx.local_addr);

        let ctx = self.ctx.clone();
        let listener = spawn(Self::listen(self.listener, ctx.clone()));

        loop {
            select! {
                _ = ctx.cancel.cancelled() => break,
                Some(msg) = self.rx.recv() => {
                    match msg {
                        NodeMsg::Command(command, recipient) => {
                            // a slow command must not hold back shutdown
                            select! {
                                _ = ctx.cancel.cancelled() => break,
                                output = ctx.execute(command) => {
                                    let _ = recipient.send(output);
                                }
                            }
                        }
                        NodeMsg::Quit => {
                            debug!("quit");
                            break;
                        }
                    }
                }
            }
        }

        ctx.shutdown().await;
        let _ = listener.await;

        info!("node stopped");

        Ok(())
    }

    /// Accept connections until cancelled, each one handshakes in its own
    /// task.
    async fn listen(listener: TcpListener, ctx: Arc<NodeCtx>) {
        loop {
            select! {
                _ = ctx.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("could not accept a connection: {e}");
                            continue;
                        }
                    };
                    debug!("{addr} accepted");

                    let ctx = ctx.clone();
                    spawn(async move {
                        if let Err(e) = ctx.accept(socket).await {
                            debug!("{addr} not admitted: {e}");
                        }
                    });
                }
            }
        }
        debug!("listener stopped");
    }
}

impl NodeCtx {
    async fn accept(self: &Arc<Self>, socket: TcpStream) -> Result<(), Error> {
        let mut peer = Peer::new(socket, Direction::Inbound)?;
        peer.handshake(&self.cancel).await?;
        peer.admit(self.clone()).await?;
        Ok(())
    }

    /// Stop every loop and join the peer handlers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        for mut entry in self.peers.drain().await {
            if timeout(JOIN_TIMEOUT, &mut entry.handle).await.is_err() {
                warn!("{} did not stop in time", entry.ctx.remote_addr);
                entry.handle.abort();
            }
        }
    }

    fn is_self(&self, addr: SocketAddr) -> bool {
        addr.port() == self.local_addr.port()
            && (addr.ip().is_loopback()
                || addr.ip().is_unspecified()
                || addr.ip() == self.local_addr.ip())
    }

    /// Open a connection, handshake as the connecting side and admit the
    /// peer.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<PeerCtx>, Error> {
        if self.is_self(addr) {
            return Err(Error::SelfConnect);
        }
        if self.peers.is_admitted(addr).await {
            return Err(Error::AlreadyConnected(addr));
        }

        let socket = select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
                socket.map_err(|_| Error::HandshakeTimeout)??
            }
        };

        let mut peer = Peer::new(socket, Direction::Outbound)?;
        peer.handshake(&self.cancel).await?;
        peer.admit(self.clone()).await
    }

    /// Send DSN to a peer and drop it from the registry.
    pub async fn disconnect(&self, addr: SocketAddr) -> Result<(), Error> {
        let peer = self
            .peers
            .find_by_address(addr)
            .await
            .ok_or(Error::PeerNotFound(addr))?;

        let entry = self.peers.remove(peer.id).await;
        let _ = peer.tx.try_send(PeerMsg::Disconnect);

        if let Some(mut entry) = entry {
            if timeout(JOIN_TIMEOUT, &mut entry.handle).await.is_err() {
                entry.handle.abort();
            }
        }

        Ok(())
    }

    /// Addresses of every peer. Each of them is sent a PNG.
    pub async fn list_peers(&self) -> Vec<SocketAddr> {
        let peers = self.peers.peers().await;

        for peer in &peers {
            let _ = peer.send(Message::Ping);
        }

        peers.iter().map(|p| p.remote_addr).collect()
    }

    /// Manage the package of `manifest`, creating its file in the storage
    /// directory when missing.
    pub async fn add_package(
        &self,
        manifest: Manifest,
    ) -> Result<Arc<Package>, Error> {
        let path = manifest.resolve(&self.directory);
        let check = manifest.file_check(&path).await?;
        debug!("{path:?}: {check}");
        self.packages.add(manifest, path).await
    }

    /// Queue the REQs described by `fetch`, returns how many were queued.
    ///
    /// The frames go to the peer's outbox, this never waits for the remote
    /// to read them.
    pub async fn fetch(&self, fetch: &Fetch) -> Result<usize, Error> {
        let peer = self
            .peers
            .find_by_address(fetch.addr)
            .await
            .ok_or(Error::PeerNotFound(fetch.addr))?;

        let package = self
            .packages
            .lookup_by_identifier(&fetch.ident)
            .await
            .ok_or(Error::PackageNotFound)?;

        let request = |chunk: &Chunk| Request {
            offset: chunk.offset,
            size: chunk.size,
            hash: chunk.hash,
            ident: fetch.ident.clone(),
        };

        let requests: Vec<Request> = match fetch.hash {
            None => {
                let package = self.packages.refresh(package.handle).await?;
                package
                    .tree
                    .missing_chunks()
                    .into_iter()
                    .filter_map(|i| package.manifest.chunks.get(i))
                    .map(request)
                    .collect()
            }
            Some(hash) => match package.chunk(&hash) {
                Some(chunk) => {
                    let offset = fetch.offset.unwrap_or(chunk.offset);
                    let end = chunk.offset.saturating_add(chunk.size);
                    let size =
                        fetch.size.unwrap_or(end.saturating_sub(offset));
                    vec![Request {
                        offset,
                        size,
                        hash,
                        ident: fetch.ident.clone(),
                    }]
                }
                None => {
                    if fetch.offset.is_some() || fetch.size.is_some() {
                        return Err(Error::InvalidInput(
                            "offset and size only apply to a chunk hash".into(),
                        ));
                    }
                    package
                        .tree
                        .chunks_of(&hash)
                        .map_err(|_| Error::ChunkNotFound)?
                        .into_iter()
                        .filter_map(|i| package.manifest.chunks.get(i))
                        .map(request)
                        .collect()
                }
            },
        };

        let sent = requests.len();

        for req in requests {
            debug!("{} requesting {} at {}", fetch.addr, req.hash, req.offset);
            peer.send(Message::Request(req))?;
        }

        Ok(sent)
    }

    /// Status line of every package, refreshing each tree first.
    async fn packages_report(&self) -> String {
        let packages = self.packages.list().await;

        if packages.is_empty() {
            return "No packages managed".into();
        }

        let mut lines = Vec::with_capacity(packages.len());

        for (i, package) in packages.into_iter().enumerate() {
            let package = match self.packages.refresh(package.handle).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    warn!("could not verify {}: {e}", package.ident());
                    package
                }
            };
            let status = if package.is_complete() {
                "COMPLETED"
            } else {
                "INCOMPLETE"
            };
            let ident: String = package.ident().chars().take(32).collect();
            lines.push(format!(
                "{}. {ident}, {} : {status}",
                i + 1,
                package.path.display()
            ));
        }

        lines.join("\n")
    }

    /// Run a command, returning the text to show the user, if any.
    pub async fn execute(self: &Arc<Self>, command: Command) -> Option<String> {
        let output = match command {
            Command::Connect(addr) => match self.connect(addr).await {
                Ok(_) => "Connection established with peer".to_owned(),
                Err(Error::AlreadyConnected(_)) => {
                    "Already connected to peer".to_owned()
                }
                Err(e) => {
                    warn!("could not connect to {addr}: {e}");
                    "Unable to connect to request peer".to_owned()
                }
            },
            Command::Disconnect(addr) => match self.disconnect(addr).await {
                Ok(()) => "Disconnected from peer".to_owned(),
                Err(_) => "Unknown peer, not connected".to_owned(),
            },
            Command::AddPackage(path) => {
                let manifest = match Manifest::load(&path).await {
                    Ok(manifest) => manifest,
                    Err(Error::FileOpen(_)) => {
                        return Some("Cannot open file".to_owned())
                    }
                    Err(e) => {
                        debug!("{path:?}: {e}");
                        return Some("Unable to parse bpkg file".to_owned());
                    }
                };
                match self.add_package(manifest).await {
                    Ok(_) => return None,
                    Err(Error::PackageExists) => {
                        "Package is already managed".to_owned()
                    }
                    Err(e) => {
                        warn!("could not add {path:?}: {e}");
                        "Unable to parse bpkg file".to_owned()
                    }
                }
            }
            Command::RemovePackage(prefix) => {
                match self.packages.remove(&prefix).await {
                    Ok(_) => "Package has been removed".to_owned(),
                    Err(_) => {
                        "Identifier provided does not match managed packages"
                            .to_owned()
                    }
                }
            }
            Command::Packages => self.packages_report().await,
            Command::Peers => {
                let peers = self.list_peers().await;
                if peers.is_empty() {
                    "Not connected to any peers".to_owned()
                } else {
                    let lines: Vec<String> = peers
                        .iter()
                        .enumerate()
                        .map(|(i, addr)| format!("{}. {addr}", i + 1))
                        .collect();
                    format!("Connected to:\n\n{}", lines.join("\n"))
                }
            }
            Command::Fetch(fetch) => match self.fetch(&fetch).await {
                Ok(0) => "Package is already complete".to_owned(),
                Ok(_) => return None,
                Err(Error::PeerNotFound(_)) => {
                    "Unable to request chunk, peer not in list".to_owned()
                }
                Err(Error::PackageNotFound) => {
                    "Unable to request chunk, package is not managed".to_owned()
                }
                Err(Error::ChunkNotFound) => CHUNK_NOT_IN_PACKAGE.to_owned(),
                Err(e) => {
                    warn!("fetch from {} failed: {e}", fetch.addr);
                    "Unable to request chunk".to_owned()
                }
            },
            Command::Quit => {
                self.cancel.cancel();
                return None;
            }
        };

        Some(output)
    }
}
