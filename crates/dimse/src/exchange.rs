//! Message exchange over an established association
//!
//! The print engine never touches PDUs; it pulls requests and pushes
//! responses through a [`MessageExchange`]. The in-memory implementation
//! connects an engine to a peer through tokio channels.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::DimseMessage;
use crate::{DimseError, Result};

/// Outcome of waiting for the next inbound message
#[derive(Debug)]
pub enum Received {
    /// A complete request
    Message(DimseMessage),
    /// The receive timeout elapsed without a message
    Idle,
    /// The peer released the association (the release has been confirmed)
    Released,
    /// The peer aborted the association
    Aborted,
}

/// Request/response exchange over one association
#[async_trait]
pub trait MessageExchange: Send {
    /// Wait for the next inbound message, honouring the blocking mode
    async fn receive(&mut self) -> Result<Received>;

    /// Send a message to the peer
    async fn send(&mut self, message: DimseMessage) -> Result<()>;

    /// Abort the association; errors are swallowed since the link is going away
    async fn abort(&mut self);
}

/// What the peer end of an in-memory exchange puts on the wire
#[derive(Debug)]
pub enum PeerEvent {
    Message(DimseMessage),
    Release,
    Abort,
}

/// Engine side of an in-memory exchange
pub struct InMemoryExchange {
    inbound: mpsc::Receiver<PeerEvent>,
    outbound: mpsc::Sender<DimseMessage>,
    timeout: Option<Duration>,
    aborted: bool,
}

/// Peer side of an in-memory exchange
pub struct PeerEnd {
    outbound: mpsc::Sender<PeerEvent>,
    inbound: mpsc::Receiver<DimseMessage>,
}

impl InMemoryExchange {
    /// Create a connected pair with the default buffer size
    pub fn pair(timeout: Option<Duration>) -> (InMemoryExchange, PeerEnd) {
        Self::with_buffer_size(timeout, 64)
    }

    /// Create a connected pair with the given buffer size
    pub fn with_buffer_size(timeout: Option<Duration>, buffer_size: usize) -> (InMemoryExchange, PeerEnd) {
        let (peer_tx, engine_rx) = mpsc::channel(buffer_size);
        let (engine_tx, peer_rx) = mpsc::channel(buffer_size);

        let exchange = InMemoryExchange {
            inbound: engine_rx,
            outbound: engine_tx,
            timeout,
            aborted: false,
        };
        let peer = PeerEnd {
            outbound: peer_tx,
            inbound: peer_rx,
        };
        (exchange, peer)
    }

    /// Whether the engine aborted this exchange
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }
}

#[async_trait]
impl MessageExchange for InMemoryExchange {
    async fn receive(&mut self) -> Result<Received> {
        let next = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.inbound.recv()).await {
                Ok(event) => event,
                Err(_) => return Ok(Received::Idle),
            },
            None => self.inbound.recv().await,
        };

        match next {
            Some(PeerEvent::Message(message)) => Ok(Received::Message(message)),
            Some(PeerEvent::Release) => Ok(Received::Released),
            Some(PeerEvent::Abort) => Ok(Received::Aborted),
            None => Err(DimseError::Closed("peer dropped the exchange".into())),
        }
    }

    async fn send(&mut self, message: DimseMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| DimseError::Closed("Failed to send response".into()))
    }

    async fn abort(&mut self) {
        debug!("Aborting in-memory exchange");
        self.aborted = true;
        self.inbound.close();
    }
}

impl PeerEnd {
    /// Send a request to the engine
    pub async fn send(&self, message: DimseMessage) -> Result<()> {
        self.outbound
            .send(PeerEvent::Message(message))
            .await
            .map_err(|_| DimseError::Closed("Failed to send request".into()))
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, message: DimseMessage) -> Result<DimseMessage> {
        self.send(message).await?;
        self.next_response().await
    }

    /// Wait for the next response from the engine
    pub async fn next_response(&mut self) -> Result<DimseMessage> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| DimseError::Closed("Failed to receive response".into()))
    }

    /// Release the association
    pub async fn release(&self) -> Result<()> {
        self.outbound
            .send(PeerEvent::Release)
            .await
            .map_err(|_| DimseError::Closed("Failed to send release".into()))
    }

    /// Abort the association
    pub async fn abort(&self) -> Result<()> {
        self.outbound
            .send(PeerEvent::Abort)
            .await
            .map_err(|_| DimseError::Closed("Failed to send abort".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{status, uids, DimseCommand};

    #[tokio::test]
    async fn test_exchange_echo() {
        let (mut exchange, mut peer) = InMemoryExchange::pair(None);

        let handle = tokio::spawn(async move {
            match exchange.receive().await.unwrap() {
                Received::Message(rq) => {
                    exchange.send(rq.response(status::SUCCESS)).await.unwrap();
                }
                other => panic!("Expected message, got {:?}", other),
            }
            exchange
        });

        let rq = DimseMessage::request(DimseCommand::CEchoRq, 1, uids::VERIFICATION, None);
        let rsp = peer.request(rq).await.unwrap();
        assert_eq!(rsp.command, DimseCommand::CEchoRsp);
        assert_eq!(rsp.status, Some(status::SUCCESS));

        handle.await.unwrap();
    }

    #[test]
    fn test_receive_times_out_as_idle() {
        tokio_test::block_on(async {
            let (mut exchange, _peer) = InMemoryExchange::pair(Some(Duration::from_millis(10)));
            assert!(matches!(exchange.receive().await.unwrap(), Received::Idle));
        });
    }

    #[tokio::test]
    async fn test_release_and_dropped_peer() {
        let (mut exchange, peer) = InMemoryExchange::pair(None);
        peer.release().await.unwrap();
        assert!(matches!(exchange.receive().await.unwrap(), Received::Released));

        drop(peer);
        assert!(exchange.receive().await.is_err());
    }
}
