use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::account::StateStore;
use super::hash::{fingerprint, BlockHash};
use super::transaction::Transaction;

/// Current time as microseconds since the Unix epoch
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Represents a block in the chain tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Hash of the parent block (`None` only for genesis)
    #[schema(value_type = Option<String>)]
    pub parent: Option<BlockHash>,

    /// Creation time in microseconds since the Unix epoch
    pub timestamp: i64,

    /// Proof of work (nonce)
    pub nonce: u64,

    /// Required number of leading zero hex digits in `hash`
    pub difficulty: u32,

    /// Transactions applied by this block, in order
    pub transactions: Vec<Transaction>,

    /// Fingerprint over `(nonce, timestamp, parent)`
    #[schema(value_type = String)]
    pub hash: BlockHash,

    /// Account state after applying `transactions` to the parent's state
    #[schema(value_type = Object)]
    pub resulting_state: StateStore,
}

impl Block {
    /// Creates the root block anchoring every chain
    ///
    /// # Arguments
    ///
    /// * `timestamp` - Genesis time; every node must agree on it
    /// * `state` - Initial balances
    pub fn genesis(timestamp: i64, state: StateStore) -> Self {
        Block {
            parent: None,
            timestamp,
            nonce: 0,
            difficulty: 0,
            transactions: Vec::new(),
            hash: fingerprint(0, timestamp, None),
            resulting_state: state,
        }
    }

    /// Recomputes the fingerprint from the header fields
    pub fn calculate_hash(&self) -> BlockHash {
        fingerprint(self.nonce, self.timestamp, self.parent.as_ref())
    }

    /// Checks if this is a root block
    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }

    /// Digest over every field, including those the fingerprint leaves out
    ///
    /// Two blocks sharing a hash but carrying different transactions or
    /// states have different content digests.
    pub fn content_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.hash.as_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update((self.transactions.len() as u64).to_be_bytes());
        for transaction in &self.transactions {
            for field in [
                &transaction.origin.0,
                &transaction.destination.0,
                &transaction.sender_signature.0,
            ] {
                hasher.update((field.len() as u64).to_be_bytes());
                hasher.update(field.as_bytes());
            }
            hasher.update(transaction.value.to_be_bytes());
        }
        hasher.update((self.resulting_state.len() as u64).to_be_bytes());
        for account in self.resulting_state.iter() {
            hasher.update((account.address.0.len() as u64).to_be_bytes());
            hasher.update(account.address.0.as_bytes());
            hasher.update(account.balance.to_be_bytes());
            hasher.update(account.nonce.to_be_bytes());
        }
        hasher.finalize().into()
    }
}

/// A block waiting for its proof of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub parent: BlockHash,
    pub timestamp: i64,
    pub difficulty: u32,
    pub transactions: Vec<Transaction>,
    pub resulting_state: StateStore,
}

impl BlockTemplate {
    /// Creates a template on top of `parent`
    ///
    /// The timestamp is the current time, bumped past the parent's so the
    /// mined block always satisfies timestamp monotonicity.
    pub fn new(
        parent: &Block,
        difficulty: u32,
        transactions: Vec<Transaction>,
        resulting_state: StateStore,
    ) -> Self {
        BlockTemplate {
            parent: parent.hash,
            timestamp: now_micros().max(parent.timestamp.saturating_add(1)),
            difficulty,
            transactions,
            resulting_state,
        }
    }

    /// Fingerprint the block would have with `nonce`
    pub fn hash_with_nonce(&self, nonce: u64) -> BlockHash {
        fingerprint(nonce, self.timestamp, Some(&self.parent))
    }

    /// Turns the template into a block sealed with `nonce`
    pub fn seal(self, nonce: u64) -> Block {
        let hash = self.hash_with_nonce(nonce);
        Block {
            parent: Some(self.parent),
            timestamp: self.timestamp,
            nonce,
            difficulty: self.difficulty,
            transactions: self.transactions,
            hash,
            resulting_state: self.resulting_state,
        }
    }
}
