//! Block validation, run as an explicit sequence of stages.
//!
//! A candidate moves `Received -> StructurallyChecked -> ProofVerified ->
//! StateVerified -> Accepted`; the first failing stage rejects it with a
//! typed reason. Accepted blocks live in the [`ChainTree`], which doubles as
//! the memo of valid blocks, and rejected ones are kept in a [`RejectionMemo`].

use dashmap::DashMap;
use log::{debug, warn};
use thiserror::Error;

use super::account::{Amount, StateError};
use super::block::Block;
use super::hash::BlockHash;
use super::pow;
use super::tree::ChainTree;
use crate::config::ConsensusParams;

/// Progress of a candidate block through validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationStage {
    Received,
    StructurallyChecked,
    ProofVerified,
    StateVerified,
    Accepted,
}

/// Why a block's transactions do not reproduce its claimed state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateMismatch {
    #[error("Transaction rejected: {0}")]
    Transition(#[from] StateError),

    #[error("Resulting state differs from the claimed state")]
    ResultDiffers,

    #[error("Reward transaction at position {0}; only the first transaction may mint")]
    MisplacedReward(usize),

    #[error("Reward of {claimed} exceeds the allowed {allowed}")]
    ExcessiveReward { claimed: Amount, allowed: Amount },
}

/// Reasons a block is refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Unknown parent {0}")]
    UnknownParent(BlockHash),

    #[error("Root block {0} is not this ledger's genesis")]
    ForeignGenesis(BlockHash),

    #[error("Stale timestamp: {timestamp} is not after parent timestamp {parent_timestamp}")]
    StaleTimestamp { timestamp: i64, parent_timestamp: i64 },

    #[error("Hash mismatch: block claims {claimed}, header hashes to {computed}")]
    HashMismatch { claimed: BlockHash, computed: BlockHash },

    #[error("Insufficient work: {hash} needs {required} leading zeros")]
    InsufficientWork { hash: BlockHash, required: u32 },

    #[error("State mismatch: {0}")]
    StateMismatch(StateMismatch),

    #[error("Ancestor {0} was rejected")]
    InvalidAncestor(BlockHash),
}

impl From<StateMismatch> for Rejection {
    fn from(mismatch: StateMismatch) -> Self {
        Rejection::StateMismatch(mismatch)
    }
}

/// Checks candidate blocks against the tree they would join
#[derive(Debug, Clone, Copy)]
pub struct BlockValidator<'a> {
    params: &'a ConsensusParams,
}

impl<'a> BlockValidator<'a> {
    pub fn new(params: &'a ConsensusParams) -> Self {
        BlockValidator { params }
    }

    /// Runs every stage against `tree`
    ///
    /// # Returns
    ///
    /// `Ok(ValidationStage::Accepted)` if the block may be inserted
    pub fn validate(&self, tree: &ChainTree, block: &Block) -> Result<ValidationStage, Rejection> {
        let mut stage = ValidationStage::Received;
        while stage != ValidationStage::Accepted {
            stage = self.advance(stage, tree, block)?;
        }
        debug!("Block {} passed validation", block.hash);
        Ok(stage)
    }

    fn advance(
        &self,
        stage: ValidationStage,
        tree: &ChainTree,
        block: &Block,
    ) -> Result<ValidationStage, Rejection> {
        match stage {
            ValidationStage::Received => {
                let parent = Self::parent(tree, block)?;
                if block.timestamp <= parent.timestamp {
                    return Err(Rejection::StaleTimestamp {
                        timestamp: block.timestamp,
                        parent_timestamp: parent.timestamp,
                    });
                }
                let computed = block.calculate_hash();
                if computed != block.hash {
                    return Err(Rejection::HashMismatch {
                        claimed: block.hash,
                        computed,
                    });
                }
                Ok(ValidationStage::StructurallyChecked)
            }
            ValidationStage::StructurallyChecked => {
                let required = block.difficulty.max(self.params.difficulty);
                if !pow::is_valid(&block.hash, required) {
                    return Err(Rejection::InsufficientWork {
                        hash: block.hash,
                        required,
                    });
                }
                Ok(ValidationStage::ProofVerified)
            }
            ValidationStage::ProofVerified => {
                let parent = Self::parent(tree, block)?;
                self.verify_state_transition(parent, block)?;
                Ok(ValidationStage::StateVerified)
            }
            ValidationStage::StateVerified | ValidationStage::Accepted => Ok(ValidationStage::Accepted),
        }
    }

    fn parent<'t>(tree: &'t ChainTree, block: &Block) -> Result<&'t Block, Rejection> {
        let parent_hash = block.parent.ok_or(Rejection::ForeignGenesis(block.hash))?;
        tree.get(&parent_hash)
            .ok_or(Rejection::UnknownParent(parent_hash))
    }

    fn verify_state_transition(&self, parent: &Block, block: &Block) -> Result<(), StateMismatch> {
        for (index, transaction) in block.transactions.iter().enumerate() {
            if !transaction.is_reward() {
                continue;
            }
            if index != 0 {
                return Err(StateMismatch::MisplacedReward(index));
            }
            if transaction.value > self.params.mining_reward {
                return Err(StateMismatch::ExcessiveReward {
                    claimed: transaction.value,
                    allowed: self.params.mining_reward,
                });
            }
        }

        let computed = parent.resulting_state.apply_all(&block.transactions)?;
        if computed != block.resulting_state {
            return Err(StateMismatch::ResultDiffers);
        }
        Ok(())
    }
}

/// Bounded record of rejected blocks
///
/// Entries are keyed by hash but also remember the full content digest: the
/// hash only covers the header, so a later block with the same header and a
/// different body is validated afresh instead of inheriting the rejection.
#[derive(Debug)]
pub struct RejectionMemo {
    entries: DashMap<BlockHash, ([u8; 32], Rejection)>,
    capacity: usize,
}

impl RejectionMemo {
    pub fn new(capacity: usize) -> Self {
        RejectionMemo {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the earlier rejection of this exact block, if any
    pub fn recall(&self, block: &Block) -> Option<Rejection> {
        let entry = self.entries.get(&block.hash)?;
        let (digest, rejection) = entry.value();
        if *digest == block.content_digest() {
            Some(rejection.clone())
        } else {
            None
        }
    }

    /// Checks whether `hash` was rejected
    pub fn is_rejected(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn remember(&self, block: &Block, rejection: Rejection) {
        if self.entries.len() >= self.capacity {
            warn!("Rejection memo reached {} entries, clearing", self.capacity);
            self.entries.clear();
        }
        self.entries
            .insert(block.hash, (block.content_digest(), rejection));
    }

    pub fn forget(&self, hash: &BlockHash) {
        self.entries.remove(hash);
    }

    /// Drops every entry rejected only for descending from `hash`
    ///
    /// Returns the number of entries removed.
    pub fn forget_descendants(&self, hash: &BlockHash) -> usize {
        let mut frontier = vec![*hash];
        let mut forgotten = 0;

        while let Some(ancestor) = frontier.pop() {
            let children: Vec<BlockHash> = self
                .entries
                .iter()
                .filter(|entry| {
                    matches!(entry.value().1, Rejection::InvalidAncestor(parent) if parent == ancestor)
                })
                .map(|entry| *entry.key())
                .collect();

            for child in children {
                if self.entries.remove(&child).is_some() {
                    forgotten += 1;
                    frontier.push(child);
                }
            }
        }
        forgotten
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
