use log::{debug, error, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::account::{Account, Address, Amount, StateStore};
use super::block::{Block, BlockTemplate};
use super::ghost::{self, ForkChoiceError};
use super::hash::BlockHash;
use super::pow::{MiningOutcome, ProofOfWork};
use super::transaction::Transaction;
use super::tree::{ChainTree, TreeError};
use super::validation::{BlockValidator, Rejection, RejectionMemo, StateMismatch};
use crate::config::ConsensusParams;

/// Errors that can occur during ledger operations
///
/// Invalid blocks are not errors: they come back as
/// [`ReceiveOutcome::Rejected`].
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Fork choice error: {0}")]
    ForkChoice(#[from] ForkChoiceError),

    #[error("Transactions do not apply to the canonical state: {0}")]
    InvalidTransactions(StateMismatch),

    #[error("Mined block failed its own validation: {0}")]
    SelfCheckFailed(Rejection),

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

/// What happened to a block handed to [`Ledger::receive_block`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Validated and inserted; `tip_changed` tells whether it became canonical
    Accepted { hash: BlockHash, tip_changed: bool },

    /// Already in the tree; nothing changed
    Duplicate(BlockHash),

    /// Refused and discarded
    Rejected(Rejection),
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiveOutcome::Accepted { .. })
    }

    pub fn tip_changed(&self) -> bool {
        matches!(self, ReceiveOutcome::Accepted { tip_changed: true, .. })
    }
}

/// What happened to a mining request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineOutcome {
    /// The block was mined, validated and inserted
    Mined(Block),

    /// The caller cancelled; `restarts` counts abandoned stale attempts
    Cancelled { restarts: u32 },
}

/// The block tree and its canonical tip, always updated together
#[derive(Debug)]
struct ChainState {
    tree: ChainTree,
    tip: BlockHash,
}

/// One node's view of the chain
///
/// All mutations of the tree and tip go through a single write lock; queries
/// take the read lock. Proof-of-work runs without holding either, and every
/// in-flight mining attempt is cancelled when the canonical tip moves.
#[derive(Debug)]
pub struct Ledger {
    params: ConsensusParams,
    chain: RwLock<ChainState>,
    rejected: RejectionMemo,
    /// Attempts to abandon on the next tip change, by attempt id
    miners: Mutex<HashMap<u64, CancellationToken>>,
    next_attempt: AtomicU64,
    pow: ProofOfWork,
}

/// Keeps a mining attempt registered until it goes out of scope
struct MinerRegistration<'a> {
    ledger: &'a Ledger,
    id: u64,
}

impl Drop for MinerRegistration<'_> {
    fn drop(&mut self) {
        self.ledger
            .miners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Ledger {
    /// Creates a ledger holding only the genesis block described by `params`
    pub fn new(params: ConsensusParams) -> Result<Self, LedgerError> {
        let genesis = Block::genesis(params.genesis_timestamp, params.genesis_state());
        let tip = genesis.hash;
        let tree = ChainTree::new(genesis)?;

        info!(
            "Initializing ledger with genesis block {} ({} accounts, difficulty {})",
            tip,
            tree.genesis_block().resulting_state.len(),
            params.difficulty
        );

        Ok(Ledger {
            rejected: RejectionMemo::new(params.rejected_cache_capacity),
            pow: ProofOfWork::new(params.cancel_check_interval),
            miners: Mutex::new(HashMap::new()),
            next_attempt: AtomicU64::new(0),
            chain: RwLock::new(ChainState { tree, tip }),
            params,
        })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        // Writers never leave the pair half-updated, so a poisoned lock still
        // holds a consistent snapshot
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ChainState>, LedgerError> {
        self.chain.write().map_err(|_| LedgerError::LockPoisoned)
    }

    /// Validates a block and, if it passes, inserts it and re-runs fork choice
    ///
    /// Any input is safe: invalid, duplicate or out-of-order blocks come back
    /// as a typed outcome and leave the ledger unchanged.
    pub fn receive_block(&self, block: Block) -> Result<ReceiveOutcome, LedgerError> {
        match self.rejected.recall(&block) {
            // The ancestor has since been accepted under an honest body
            Some(Rejection::InvalidAncestor(parent)) if self.contains(&parent) => {
                debug!("Revalidating {}, its parent {} is now known", block.hash, parent);
                self.rejected.forget(&block.hash);
            }
            Some(rejection) => {
                debug!("Block {} was already rejected: {}", block.hash, rejection);
                return Ok(ReceiveOutcome::Rejected(rejection));
            }
            None => {}
        }

        // Parents are never removed, so a verdict reached under the read
        // lock still holds once the write lock is taken
        {
            let chain = self.read();
            if chain.tree.contains(&block.hash) {
                return Ok(ReceiveOutcome::Duplicate(block.hash));
            }
            if let Err(rejection) = self.check(&chain.tree, &block) {
                warn!("Rejected block {}: {}", block.hash, rejection);
                if !matches!(rejection, Rejection::UnknownParent(_)) {
                    self.rejected.remember(&block, rejection.clone());
                }
                return Ok(ReceiveOutcome::Rejected(rejection));
            }
        }

        let hash = block.hash;
        let mut chain = self.write()?;
        if chain.tree.contains(&hash) {
            return Ok(ReceiveOutcome::Duplicate(hash));
        }
        chain.tree.insert(block)?;
        self.rejected.forget(&hash);
        let cleared = self.rejected.forget_descendants(&hash);
        if cleared > 0 {
            debug!("Cleared {} memoized rejections below {}", cleared, hash);
        }

        let decision = ghost::evaluate(&chain.tree, &chain.tip, &hash).map_err(|err| {
            error!("Fork choice failed for block {}: {}", hash, err);
            err
        })?;
        debug!(
            "Accepted block {} (fork point {}, weights {} vs {})",
            hash, decision.fork_point, decision.current_weight, decision.candidate_weight
        );

        if decision.switched {
            let previous = chain.tip;
            chain.tip = decision.tip;
            drop(chain);
            info!("Canonical tip moved from {} to {}", previous, decision.tip);
            self.cancel_stale_miners();
        }

        Ok(ReceiveOutcome::Accepted {
            hash,
            tip_changed: decision.switched,
        })
    }

    fn check(&self, tree: &ChainTree, block: &Block) -> Result<(), Rejection> {
        if let Some(parent) = block.parent {
            if !tree.contains(&parent) && self.rejected.is_rejected(&parent) {
                return Err(Rejection::InvalidAncestor(parent));
            }
        }
        BlockValidator::new(&self.params).validate(tree, block)?;
        Ok(())
    }

    /// Receives a snapshot of blocks in any order
    ///
    /// Blocks are handed to [`Ledger::receive_block`] parent first. Whatever
    /// cannot be connected is still passed through so it gets its rejection.
    pub fn receive_chain(
        &self,
        blocks: Vec<Block>,
    ) -> Result<Vec<ReceiveOutcome>, LedgerError> {
        let mut outcomes = Vec::with_capacity(blocks.len());
        let mut pending = blocks;

        while !pending.is_empty() {
            let (ready, waiting): (Vec<Block>, Vec<Block>) = {
                let chain = self.read();
                pending.into_iter().partition(|block| match block.parent {
                    Some(parent) => chain.tree.contains(&parent) || self.rejected.is_rejected(&parent),
                    None => true,
                })
            };

            if ready.is_empty() {
                // Nothing else connects; let each leftover be rejected
                for block in waiting {
                    outcomes.push(self.receive_block(block)?);
                }
                break;
            }

            for block in ready {
                outcomes.push(self.receive_block(block)?);
            }
            pending = waiting;
        }

        Ok(outcomes)
    }

    fn cancel_stale_miners(&self) {
        let mut miners = self.miners.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, token) in miners.drain() {
            token.cancel();
        }
    }

    fn register_miner(&self, token: CancellationToken) -> MinerRegistration<'_> {
        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        self.miners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token);
        MinerRegistration { ledger: self, id }
    }

    /// Number of mining attempts currently in flight
    pub fn active_miners(&self) -> usize {
        self.miners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Builds an unmined block on the canonical tip
    ///
    /// The reward for `miner` comes first, followed by `transactions`.
    pub fn block_template(
        &self,
        miner: &Address,
        transactions: &[Transaction],
        difficulty: u32,
    ) -> Result<BlockTemplate, LedgerError> {
        let mut body = Vec::with_capacity(transactions.len() + 1);
        body.push(Transaction::reward(miner.clone(), self.params.mining_reward));
        body.extend(transactions.iter().cloned());

        let chain = self.read();
        let tip = chain.tree.get(&chain.tip).ok_or(TreeError::UnknownBlock(chain.tip))?;

        if let Some(index) = transactions.iter().position(Transaction::is_reward) {
            return Err(LedgerError::InvalidTransactions(StateMismatch::MisplacedReward(index + 1)));
        }
        let state = tip
            .resulting_state
            .apply_all(&body)
            .map_err(|err| LedgerError::InvalidTransactions(err.into()))?;

        Ok(BlockTemplate::new(tip, difficulty, body, state))
    }

    /// Mines a block with `transactions` on the canonical tip at the ledger's difficulty
    pub fn mine_next_block(
        &self,
        miner: &Address,
        transactions: Vec<Transaction>,
        cancel: &CancellationToken,
    ) -> Result<MineOutcome, LedgerError> {
        self.mine_next_block_at(miner, transactions, self.params.difficulty, cancel)
    }

    /// Mines at `difficulty`, raised to the ledger's floor if lower
    ///
    /// Whenever the canonical tip moves mid-search, the attempt is dropped
    /// and restarted on the new tip. Only `cancel` ends the search early.
    pub fn mine_next_block_at(
        &self,
        miner: &Address,
        transactions: Vec<Transaction>,
        difficulty: u32,
        cancel: &CancellationToken,
    ) -> Result<MineOutcome, LedgerError> {
        let difficulty = difficulty.max(self.params.difficulty);
        let mut restarts = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(MineOutcome::Cancelled { restarts });
            }

            // Registered before the template is read, so a tip change in
            // between still cancels this attempt
            let attempt = cancel.child_token();
            let _registration = self.register_miner(attempt.clone());
            let template = self.block_template(miner, &transactions, difficulty)?;
            let parent = template.parent;

            match self.pow.mine(template, &attempt) {
                MiningOutcome::Mined(block) if !attempt.is_cancelled() => {
                    let hash = block.hash;
                    match self.receive_block(block.clone())? {
                        ReceiveOutcome::Accepted { .. } | ReceiveOutcome::Duplicate(_) => {
                            info!("Mined block {} on {} with nonce {}", hash, parent, block.nonce);
                            return Ok(MineOutcome::Mined(block));
                        }
                        ReceiveOutcome::Rejected(rejection) => {
                            error!("Mined block {} failed validation: {}", hash, rejection);
                            return Err(LedgerError::SelfCheckFailed(rejection));
                        }
                    }
                }
                MiningOutcome::Exhausted => {
                    debug!("Nonce space exhausted on {}, refreshing template", parent);
                }
                MiningOutcome::Mined(_) | MiningOutcome::Cancelled { .. } => {
                    if cancel.is_cancelled() {
                        return Ok(MineOutcome::Cancelled { restarts });
                    }
                    restarts += 1;
                    info!("Canonical tip moved while mining on {}, restarting", parent);
                }
            }
        }
    }

    /// Hash of the canonical tip
    pub fn canonical_tip(&self) -> BlockHash {
        self.read().tip
    }

    pub fn canonical_block(&self) -> Block {
        let chain = self.read();
        chain
            .tree
            .get(&chain.tip)
            .cloned()
            .unwrap_or_else(|| chain.tree.genesis_block().clone())
    }

    /// Account state at the canonical tip
    pub fn canonical_state(&self) -> StateStore {
        self.canonical_block().resulting_state
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.canonical_state().balance(address)
    }

    pub fn account(&self, address: &Address) -> Account {
        self.canonical_state().account(address)
    }

    /// Height of the canonical tip above genesis
    pub fn height(&self) -> u64 {
        let chain = self.read();
        chain.tree.height(&chain.tip).unwrap_or(0)
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.read().tree.genesis()
    }

    pub fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.read().tree.get(hash).cloned()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.read().tree.contains(hash)
    }

    /// Number of blocks in the tree, losing branches included
    pub fn block_count(&self) -> usize {
        self.read().tree.len()
    }

    pub fn subtree_size(&self, hash: &BlockHash) -> Result<usize, LedgerError> {
        Ok(self.read().tree.subtree_size(hash)?)
    }

    /// Canonical chain from genesis to tip, for broadcast
    pub fn export_canonical_chain(&self) -> Vec<Block> {
        let chain = self.read();
        chain
            .tree
            .path_to_root(&chain.tip)
            .map(|path| path.into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every known block, parents before children
    pub fn export_tree(&self) -> Vec<Block> {
        let chain = self.read();
        let mut blocks: Vec<(u64, Block)> = chain
            .tree
            .blocks()
            .map(|block| (chain.tree.height(&block.hash).unwrap_or(0), block.clone()))
            .collect();
        blocks.sort_by(|(ha, a), (hb, b)| ha.cmp(hb).then(a.hash.cmp(&b.hash)));
        blocks.into_iter().map(|(_, block)| block).collect()
    }
}
