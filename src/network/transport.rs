//! Outbound gossip seam and an in-memory implementation of it.
//!
//! The ledger never talks to the network directly: a [`Node`] hands encoded
//! snapshots to a [`Broadcaster`], and whatever arrives in a transport's inbox
//! is fed back through the node.
//!
//! [`Node`]: super::node::Node

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Mutex;

use std::sync::Arc;

/// Capacity of each transport's inbox
const INBOX_CAPACITY: usize = 1024;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Failed to send message to {0}")]
    SendFailed(String),

    #[error("Broadcast failed for peers: {}", .0.join(", "))]
    BroadcastFailed(Vec<String>),

    #[error("Inbox of {0} was already taken")]
    InboxTaken(String),
}

/// Payload delivered to a transport's inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Address of the sending transport
    pub from: String,
    pub payload: Vec<u8>,
}

/// Sends encoded gossip to every connected peer
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Delivers `payload` to all peers, attempting each even if some fail
    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Returns the local address of this broadcaster
    fn addr(&self) -> String;
}

/// In-memory transport routing payloads through tokio channels
///
/// Suitable for tests and single-process simulations of several nodes.
pub struct LocalTransport {
    address: String,
    peers: DashMap<String, Sender<Envelope>>,
    tx: Sender<Envelope>,
    rx: Mutex<Option<Receiver<Envelope>>>,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("address", &self.address)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl LocalTransport {
    /// Creates a transport with an empty peer table
    pub fn new(address: &str) -> Arc<LocalTransport> {
        let (tx, rx) = channel(INBOX_CAPACITY);

        Arc::new(LocalTransport {
            address: address.to_string(),
            peers: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Connects two transports in both directions
    pub fn connect(self: &Arc<Self>, other: &Arc<LocalTransport>) {
        self.peers.insert(other.address.clone(), other.tx.clone());
        other.peers.insert(self.address.clone(), self.tx.clone());
    }

    /// Removes a peer from this side only
    pub fn disconnect(&self, address: &str) -> bool {
        self.peers.remove(address).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Takes the inbox; only the first caller gets it
    pub async fn consume(&self) -> Result<Receiver<Envelope>, TransportError> {
        self.rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::InboxTaken(self.address.clone()))
    }

    /// Sends `payload` to a single peer
    pub async fn send_message(&self, to: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::PeerNotFound(to.to_string()))?;

        peer.send(Envelope {
            from: self.address.clone(),
            payload,
        })
        .await
        .map_err(|_| TransportError::SendFailed(to.to_string()))
    }
}

#[async_trait]
impl Broadcaster for LocalTransport {
    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let peers: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        debug!("{} broadcasting {} bytes to {} peers", self.address, payload.len(), peers.len());

        let results = join_all(
            peers
                .iter()
                .map(|peer| self.send_message(peer, payload.clone())),
        )
        .await;
        let failed: Vec<String> = results
            .into_iter()
            .zip(peers)
            .filter_map(|(result, peer)| result.err().map(|_| peer))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            warn!("{} could not reach peers: {}", self.address, failed.join(", "));
            Err(TransportError::BroadcastFailed(failed))
        }
    }

    fn addr(&self) -> String {
        self.address.clone()
    }
}
