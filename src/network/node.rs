//! Glue between the ledger and the network.
//!
//! A [`Node`] owns the inbound path (decode, hand to the ledger, persist) and
//! the outbound one (broadcast the canonical chain whenever the tip moves).
//! Ledger calls are synchronous; mining is pushed onto tokio's blocking pool.

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use super::message::{GossipMessage, MessageError};
use super::transport::{Broadcaster, Envelope, TransportError};
use crate::blockchain::account::Address;
use crate::blockchain::block::Block;
use crate::blockchain::ledger::{Ledger, LedgerError, MineOutcome, ReceiveOutcome};
use crate::blockchain::storage::{BlockStore, StorageError};
use crate::blockchain::transaction::Transaction;

/// Errors that can occur in node operations
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// A ledger wired to a broadcaster and, optionally, durable storage
pub struct Node {
    ledger: Arc<Ledger>,
    broadcaster: Arc<dyn Broadcaster>,
    store: Option<Arc<BlockStore>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.broadcaster.addr())
            .field("tip", &self.ledger.canonical_tip())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Node {
    pub fn new(ledger: Arc<Ledger>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Node {
            ledger,
            broadcaster,
            store: None,
        }
    }

    /// Persists every accepted block to `store`
    pub fn with_store(mut self, store: Arc<BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn address(&self) -> String {
        self.broadcaster.addr()
    }

    /// Replays stored blocks through the ledger
    ///
    /// Every block is validated again; stored blocks that no longer pass are
    /// skipped. Returns the number of blocks accepted.
    pub fn restore(&self) -> Result<usize, NodeError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(0),
        };

        let blocks = store.load_blocks()?;
        let total = blocks.len();
        let outcomes = self.ledger.receive_chain(blocks)?;
        let accepted = outcomes.iter().filter(|outcome| outcome.is_accepted()).count();
        let rejected = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, ReceiveOutcome::Rejected(_)))
            .count();
        if rejected > 0 {
            warn!("{} stored blocks failed revalidation", rejected);
        }

        let tip = self.ledger.canonical_tip();
        if let Some(stored_tip) = store.load_tip()? {
            if stored_tip != tip {
                debug!("Stored tip {} differs from recomputed tip {}", stored_tip, tip);
            }
        }
        info!(
            "Restored {} of {} stored blocks, canonical tip {} at height {}",
            accepted,
            total,
            tip,
            self.ledger.height()
        );
        Ok(accepted)
    }

    /// Handles gossip from a peer
    ///
    /// Invalid and duplicate blocks are reported in the returned outcomes and
    /// otherwise ignored. If the canonical tip moved, the new canonical chain
    /// is broadcast.
    pub async fn on_block_received(
        &self,
        message: GossipMessage,
    ) -> Result<Vec<ReceiveOutcome>, NodeError> {
        debug!("{} received {} blocks", self.address(), message.len());
        let outcomes = self.ledger.receive_chain(message.into_blocks())?;

        let mut tip_changed = false;
        for outcome in &outcomes {
            if let ReceiveOutcome::Accepted { hash, tip_changed: moved } = outcome {
                tip_changed |= *moved;
                if let Some(block) = self.ledger.block(hash) {
                    self.persist(&block);
                }
            }
        }

        if tip_changed {
            self.persist_tip();
            self.announce().await;
        }
        Ok(outcomes)
    }

    /// Decodes a raw payload and handles it as gossip
    pub async fn on_payload(&self, payload: &[u8]) -> Result<Vec<ReceiveOutcome>, NodeError> {
        let message = GossipMessage::decode(payload)?;
        self.on_block_received(message).await
    }

    /// Mines one block on the canonical tip and broadcasts the result
    pub async fn mine_block(
        &self,
        miner: Address,
        transactions: Vec<Transaction>,
    ) -> Result<Block, NodeError> {
        match self.mine_with(miner, transactions, CancellationToken::new()).await? {
            MineOutcome::Mined(block) => Ok(block),
            MineOutcome::Cancelled { .. } => Err(NodeError::Task("mining was cancelled".into())),
        }
    }

    async fn mine_with(
        &self,
        miner: Address,
        transactions: Vec<Transaction>,
        cancel: CancellationToken,
    ) -> Result<MineOutcome, NodeError> {
        let ledger = Arc::clone(&self.ledger);
        let outcome = tokio::task::spawn_blocking(move || {
            ledger.mine_next_block(&miner, transactions, &cancel)
        })
        .await
        .map_err(|e| NodeError::Task(e.to_string()))??;

        if let MineOutcome::Mined(block) = &outcome {
            self.persist(block);
            self.persist_tip();
            self.announce().await;
        }
        Ok(outcome)
    }

    /// Broadcasts the canonical chain from genesis to tip
    pub async fn broadcast_canonical_chain(&self) -> Result<(), NodeError> {
        let payload = GossipMessage::Chain(self.ledger.export_canonical_chain()).encode()?;
        self.broadcaster.broadcast(payload).await?;
        Ok(())
    }

    async fn announce(&self) {
        if let Err(e) = self.broadcast_canonical_chain().await {
            warn!("Failed to broadcast canonical chain: {}", e);
        }
    }

    fn persist(&self, block: &Block) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_block(block) {
                warn!("Failed to persist block {}: {}", block.hash, e);
            }
        }
    }

    fn persist_tip(&self) {
        if let Some(store) = &self.store {
            let tip = self.ledger.canonical_tip();
            if let Err(e) = store.save_tip(&tip).and_then(|_| store.flush()) {
                warn!("Failed to persist tip {}: {}", tip, e);
            }
        }
    }

    /// Handles everything arriving in `inbox` until it closes
    pub fn spawn_listener(self: &Arc<Self>, mut inbox: Receiver<Envelope>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Err(e) = node.on_payload(&envelope.payload).await {
                    warn!("Dropping payload from {}: {}", envelope.from, e);
                }
            }
            debug!("Inbox of {} closed", node.address());
        })
    }

    /// Mines empty blocks for `miner` until the handle is stopped
    ///
    /// Each search restarts on its own whenever the canonical tip moves.
    pub fn spawn_miner(self: &Arc<Self>, miner: Address) -> MinerHandle {
        let node = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            info!("Starting miner for {}", miner);
            let mut mined = 0;
            loop {
                match node.mine_with(miner.clone(), Vec::new(), token.child_token()).await {
                    Ok(MineOutcome::Mined(_)) => mined += 1,
                    Ok(MineOutcome::Cancelled { restarts }) => {
                        debug!("Miner stopped after {} restarts", restarts);
                        break;
                    }
                    Err(e) => {
                        error!("Miner failed: {}", e);
                        break;
                    }
                }
            }
            info!("Miner for {} stopped after {} blocks", miner, mined);
            mined
        });

        MinerHandle { cancel, task }
    }
}

/// Controls a background miner started by [`Node::spawn_miner`]
#[derive(Debug)]
pub struct MinerHandle {
    cancel: CancellationToken,
    task: JoinHandle<u64>,
}

impl MinerHandle {
    /// Stops the miner and returns how many blocks it mined
    pub async fn stop(self) -> Result<u64, NodeError> {
        self.cancel.cancel();
        self.task.await.map_err(|e| NodeError::Task(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
