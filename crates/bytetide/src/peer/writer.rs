//! Write half of a peer connection.
use std::net::SocketAddr;

use futures::{stream::SplitSink, SinkExt};
use tokio::{net::TcpStream, select, sync::mpsc};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::debug;

use crate::{
    error::Error,
    wire::{FrameCodec, Message},
};

/// Drains the outbox of a peer into its socket.
///
/// Frames are queued by the handler and by the node without waiting on the
/// socket, so the handler keeps reading while the remote is slow to read
/// what we send.
pub struct Writer {
    pub sink: SplitSink<Framed<TcpStream, FrameCodec>, Message>,
    pub outbox: mpsc::UnboundedReceiver<Message>,
    pub remote_addr: SocketAddr,
}

impl Writer {
    /// Send queued frames in order until `closing` fires, then flush what is
    /// left and close the sink.
    pub async fn run(mut self, closing: CancellationToken) -> Result<(), Error> {
        let remote = self.remote_addr;
        let mut sent = 0usize;

        loop {
            select! {
                biased;
                msg = self.outbox.recv() => {
                    let Some(msg) = msg else { break };
                    self.sink.send(msg).await?;
                    sent += 1;
                }
                _ = closing.cancelled() => {
                    self.outbox.close();
                    while let Some(msg) = self.outbox.recv().await {
                        self.sink.send(msg).await?;
                        sent += 1;
                    }
                    break;
                }
            }
        }

        self.sink.close().await?;
        debug!("{remote} writer stopped after {sent} frames");

        Ok(())
    }
}
