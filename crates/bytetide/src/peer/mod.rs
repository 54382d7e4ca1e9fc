//! A remote peer we exchange package data with.
mod handshake;
pub mod registry;
mod types;
pub mod writer;

// re-exports
pub use handshake::*;
pub use registry::*;
pub use types::*;

use std::{
    io::SeekFrom, net::SocketAddr, ops::ControlFlow, sync::Arc, time::Duration,
};

use futures::{stream::SplitStream, StreamExt};
use tokio::{
    io::AsyncSeekExt, net::TcpStream, select, spawn, sync::mpsc, time::timeout,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    node::NodeCtx,
    peer::writer::Writer,
    store,
    wire::{FrameCodec, Message, Request, Response, DATA_MAX, RES_ERROR},
};

/// How long the writer gets to flush queued frames once the handler stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub trait PeerState {}

/// Connection accepted or opened, handshake pending.
pub struct Open {
    pub socket: Framed<TcpStream, FrameCodec>,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
}

/// Connection admitted in the registry.
pub struct Active {
    pub ctx: Arc<PeerCtx>,
    pub node_ctx: Arc<NodeCtx>,
    pub stream: SplitStream<Framed<TcpStream, FrameCodec>>,
    pub rx: mpsc::Receiver<PeerMsg>,
    /// Taken by the handler when it starts.
    writer: Option<Writer>,
}

impl PeerState for Open {}
impl PeerState for Active {}

/// A connection with a remote peer, typed by how far along it is.
pub struct Peer<S: PeerState> {
    pub state: S,
}

impl Peer<Open> {
    pub fn new(socket: TcpStream, direction: Direction) -> Result<Self, Error> {
        let remote_addr = socket.peer_addr()?;
        Ok(Self {
            state: Open {
                socket: Framed::new(socket, FrameCodec),
                remote_addr,
                direction,
            },
        })
    }

    /// Register the peer in the node's registry and start its handler.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExceeded`] when the registry is full, the socket is
    /// closed in that case.
    pub async fn admit(
        self,
        node_ctx: Arc<NodeCtx>,
    ) -> Result<Arc<PeerCtx>, Error> {
        let (tx, rx) = mpsc::channel::<PeerMsg>(100);
        let (outbox, outbox_rx) = mpsc::unbounded_channel::<Message>();
        let Open { socket, remote_addr, direction } = self.state;

        let ctx = Arc::new(PeerCtx {
            id: node_ctx.peers.next_id(),
            remote_addr,
            direction,
            tx,
            outbox,
        });

        let (sink, stream) = socket.split();

        let peer = Peer {
            state: Active {
                ctx: ctx.clone(),
                node_ctx: node_ctx.clone(),
                stream,
                rx,
                writer: Some(Writer { sink, outbox: outbox_rx, remote_addr }),
            },
        };

        node_ctx.peers.add(ctx.clone(), peer.run_until_closed()).await?;
        info!("connected with {remote_addr}");

        Ok(ctx)
    }
}

impl Peer<Active> {
    /// Run the handler, then leave the registry whatever the reason for
    /// stopping was.
    async fn run_until_closed(mut self) {
        let remote = self.state.ctx.remote_addr;

        let closing = CancellationToken::new();
        let writer = self
            .state
            .writer
            .take()
            .map(|writer| spawn(writer.run(closing.clone())));

        if let Err(e) = self.run().await {
            warn!("{remote} connection failed: {e}");
        }

        self.state.node_ctx.peers.remove(self.state.ctx.id).await;

        closing.cancel();
        if let Some(mut writer) = writer {
            match timeout(FLUSH_TIMEOUT, &mut writer).await {
                Ok(Ok(Err(e))) => debug!("{remote} writer failed: {e}"),
                Ok(_) => {}
                Err(_) => {
                    debug!("{remote} writer did not flush in time");
                    writer.abort();
                }
            }
        }

        info!("disconnected from {remote}");
    }

    /// Start the event loop of the Peer, handling frames in arrival order
    /// until the remote disconnects, the connection fails or the node stops.
    ///
    /// Nothing in here waits on the socket for writing, frames go through
    /// the outbox.
    #[tracing::instrument(skip_all, name = "peer", fields(id = %self.state.ctx.id))]
    pub async fn run(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let cancel = self.state.node_ctx.cancel.clone();

        loop {
            select! {
                _ = cancel.cancelled() => {
                    debug!("{remote} node is stopping, sending DSN");
                    let _ = self.state.ctx.send(Message::Dsn);
                    return Ok(());
                }
                Some(msg) = self.state.rx.recv() => {
                    match msg {
                        PeerMsg::Disconnect => {
                            debug!("{remote} sending DSN");
                            self.state.ctx.send(Message::Dsn)?;
                            return Ok(());
                        }
                    }
                }
                frame = self.state.stream.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            if self.handle_message(msg).await?.is_break() {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            debug!("{remote} closed the connection");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        msg: Message,
    ) -> Result<ControlFlow<()>, Error> {
        let remote = self.state.ctx.remote_addr;

        match msg {
            Message::Dsn => {
                debug!("{remote} DSN");
                return Ok(ControlFlow::Break(()));
            }
            Message::Ack | Message::Pong => {}
            Message::Acp => {
                debug!("{remote} ACP, echoing");
                self.state.ctx.send(Message::Acp)?;
            }
            Message::Ping => {
                debug!("{remote} PNG");
                self.state.ctx.send(Message::Pong)?;
            }
            Message::Request(req) => {
                debug!(
                    "{remote} REQ {} offset {} size {}",
                    req.hash, req.offset, req.size
                );
                self.serve_request(req).await?;
            }
            Message::Response(res) => {
                self.apply_response(res).await;
            }
            Message::ResponseError(code) => {
                warn!("{remote} could not serve our request, error {code}");
            }
            Message::Unknown(kind) => {
                warn!("{remote} sent an unknown message kind {kind:#04x}");
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Queue the requested range as RES frames. Only a closed outbox is an
    /// error, a range that can't be read is answered with a single error RES
    /// when nothing was queued yet.
    async fn serve_request(&mut self, req: Request) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        let package = self
            .state
            .node_ctx
            .packages
            .lookup_by_identifier(&req.ident)
            .await
            .filter(|p| p.manifest.chunk(&req.hash).is_some());

        let Some(package) = package else {
            warn!("{remote} requested a chunk we don't manage");
            self.state.ctx.send(Message::ResponseError(RES_ERROR))?;
            return Ok(());
        };

        let mut file = match store::open_file(&package.path, false).await {
            Ok(file) => file,
            Err(e) => {
                warn!("{remote} {e}");
                self.state.ctx.send(Message::ResponseError(RES_ERROR))?;
                return Ok(());
            }
        };

        let mut sent = 0;

        if let Err(e) = file.seek(SeekFrom::Start(req.offset as u64)).await {
            warn!("{remote} could not seek to {}: {e}", req.offset);
        } else {
            let mut offset = req.offset;
            let mut remaining = req.size as usize;
            let mut buf = vec![0u8; DATA_MAX];

            while remaining > 0 {
                let want = remaining.min(DATA_MAX);
                let read = match store::read_full(&mut file, &mut buf[..want])
                    .await
                {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(e) => {
                        warn!("{remote} read failed at {offset}: {e}");
                        break;
                    }
                };

                self.state.ctx.send(Message::Response(Response {
                    offset,
                    data: buf[..read].to_vec(),
                    hash: req.hash,
                    ident: req.ident.clone(),
                }))?;

                sent += 1;
                offset = offset.saturating_add(read as u32);
                remaining -= read;
            }
        }

        if sent == 0 {
            self.state.ctx.send(Message::ResponseError(RES_ERROR))?;
        }

        debug!("{remote} served {} with {sent} RES frames", req.hash);

        Ok(())
    }

    /// Write the bytes of a RES into our copy of the package file.
    async fn apply_response(&self, res: Response) {
        let remote = self.state.ctx.remote_addr;

        let Some(package) = self
            .state
            .node_ctx
            .packages
            .lookup_by_identifier(&res.ident)
            .await
        else {
            warn!("{remote} RES for a package we don't manage");
            return;
        };

        match store::write_at(&package.path, res.offset, &res.data).await {
            Ok(()) => debug!(
                "{remote} RES wrote {} bytes at {}",
                res.data.len(),
                res.offset
            ),
            Err(e) => warn!("{remote} could not apply RES: {e}"),
        }
    }
}
