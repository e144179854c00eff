use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::message::Message;

/// Largest payload a single UDP datagram can carry
const MAX_DATAGRAM: usize = 65_507;

/// Errors that can occur while sending messages
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Message of {0} bytes does not fit in a datagram")]
    TooLarge(usize),
}

/// What the consensus core needs from the network
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort send of `message` to every connected peer
    async fn broadcast(&self, message: Message) -> Result<(), TransportError>;

    fn connected_peer_count(&self) -> usize;
}

#[derive(Debug, Serialize, Deserialize)]
enum Datagram {
    Heartbeat,
    Message(Message),
}

/// Gossip over UDP between a static set of peers
///
/// Every first-seen message is delivered once to the node and re-flooded to
/// all peers except the one it came from. A peer counts as connected while
/// its heartbeats keep arriving.
pub struct UdpTransport {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    last_seen: DashMap<SocketAddr, Instant>,
    seen_messages: DashMap<Uuid, Instant>,
    heartbeat_interval: Duration,
}

impl UdpTransport {
    pub async fn bind(
        listen: SocketAddr,
        peers: Vec<SocketAddr>,
        heartbeat_interval: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(listen).await?;
        Ok(Arc::new(UdpTransport {
            socket,
            peers,
            last_seen: DashMap::new(),
            seen_messages: DashMap::new(),
            heartbeat_interval,
        }))
    }

    /// Starts the receive loop and the heartbeat loop
    pub fn spawn(self: &Arc<Self>, inbound: mpsc::Sender<Message>) -> Vec<JoinHandle<()>> {
        let receiver = {
            let transport = self.clone();
            tokio::spawn(async move { transport.receive_loop(inbound).await })
        };

        let heartbeat = {
            let transport = self.clone();
            tokio::spawn(async move { transport.heartbeat_loop().await })
        };

        vec![receiver, heartbeat]
    }

    async fn receive_loop(&self, inbound: mpsc::Sender<Message>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Failed to receive datagram: {}", e);
                    continue;
                }
            };

            self.last_seen.insert(source, Instant::now());

            let datagram: Datagram = match serde_json::from_slice(&buf[..len]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("Dropping malformed datagram from {}: {}", source, e);
                    continue;
                }
            };

            let Datagram::Message(message) = datagram else {
                continue;
            };

            if self.seen_messages.insert(message.message_id, Instant::now()).is_some() {
                continue;
            }

            if let Err(e) = self.send_to_peers(&Datagram::Message(message.clone()), Some(source)).await {
                error!("Failed to forward message {}: {}", message.message_id, e);
            }

            if inbound.send(message).await.is_err() {
                debug!("Inbound channel closed, stopping receive loop");
                return;
            }
        }
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.send_to_peers(&Datagram::Heartbeat, None).await {
                warn!("Failed to send heartbeat: {}", e);
            }
            self.forget_old_messages();
        }
    }

    fn forget_old_messages(&self) {
        let horizon = self.heartbeat_interval * 720;
        self.seen_messages.retain(|_, seen| seen.elapsed() < horizon);
    }

    async fn send_to_peers(&self, datagram: &Datagram, except: Option<SocketAddr>) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(datagram)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(TransportError::TooLarge(bytes.len()));
        }

        for peer in self.peers.iter().filter(|p| Some(**p) != except) {
            if let Err(e) = self.socket.send_to(&bytes, *peer).await {
                debug!("Failed to send to {}: {}", peer, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        // Our own messages must not be handled when peers flood them back
        self.seen_messages.insert(message.message_id, Instant::now());
        self.send_to_peers(&Datagram::Message(message), None).await
    }

    fn connected_peer_count(&self) -> usize {
        let liveness = self.heartbeat_interval * 3;
        self.peers
            .iter()
            .filter(|peer| {
                self.last_seen
                    .get(*peer)
                    .map(|seen| seen.elapsed() <= liveness)
                    .unwrap_or(false)
            })
            .count()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records broadcasts instead of sending them
    #[derive(Default)]
    pub struct MemoryTransport {
        peers: AtomicUsize,
        block_delay_millis: AtomicU64,
        sent: Mutex<Vec<Message>>,
    }

    impl MemoryTransport {
        pub fn with_peers(peers: usize) -> Arc<Self> {
            let transport = MemoryTransport::default();
            transport.peers.store(peers, Ordering::SeqCst);
            Arc::new(transport)
        }

        pub fn set_peers(&self, peers: usize) {
            self.peers.store(peers, Ordering::SeqCst);
        }

        /// Makes every block broadcast take `delay` before it is recorded
        pub fn delay_blocks(&self, delay: Duration) {
            self.block_delay_millis
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
            let delay = self.block_delay_millis.load(Ordering::SeqCst);
            if delay > 0 && matches!(message.payload, crate::node::message::Payload::Block(_)) {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn connected_peer_count(&self) -> usize {
            self.peers.load(Ordering::SeqCst)
        }
    }
}
