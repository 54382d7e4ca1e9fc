use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{
    select,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::Error, wire::Message};

use super::{Direction, Open, Peer};

/// How long a handshake may take in total.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound of a single wait for the next handshake frame.
const POLL: Duration = Duration::from_secs(1);

impl Peer<Open> {
    /// Do the ACP/ACK exchange.
    ///
    /// The accepting side greets with ACP and waits for ACK, the connecting
    /// side waits for ACP and answers with ACK.
    pub async fn handshake(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let remote = self.state.remote_addr;

        match self.state.direction {
            Direction::Inbound => {
                debug!("{remote} sending ACP");
                self.state.socket.send(Message::Acp).await?;
                self.expect(Message::Ack, cancel).await?;
                debug!("{remote} received ACK");
            }
            Direction::Outbound => {
                self.expect(Message::Acp, cancel).await?;
                debug!("{remote} received ACP, sending ACK");
                self.state.socket.send(Message::Ack).await?;
            }
        }

        Ok(())
    }

    /// Wait for `want` in bounded steps, giving up on cancellation or once
    /// [`HANDSHAKE_TIMEOUT`] elapsed.
    async fn expect(
        &mut self,
        want: Message,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout);
            }

            let frame = select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                frame = timeout(POLL, self.state.socket.next()) => frame,
            };

            match frame {
                // nothing yet, check the deadline again
                Err(_) => continue,
                Ok(Some(Ok(msg))) if msg == want => return Ok(()),
                Ok(Some(Ok(_))) | Ok(None) => {
                    return Err(Error::HandshakeInvalid)
                }
                Ok(Some(Err(e))) => return Err(e),
            }
        }
    }
}
