//! Proof-of-work check and cancellable nonce search.

use log::debug;
use tokio_util::sync::CancellationToken;

use super::block::{Block, BlockTemplate};
use super::hash::BlockHash;

/// Nonce attempts between two cancellation checks
pub const DEFAULT_CHECK_INTERVAL: u64 = 1024;

/// Checks that `hash` has at least `difficulty` leading zero hex digits
pub fn is_valid(hash: &BlockHash, difficulty: u32) -> bool {
    hash.leading_zero_digits() >= difficulty
}

/// Result of a nonce search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    /// A nonce satisfying the difficulty was found
    Mined(Block),

    /// The search was stopped through its cancel token
    Cancelled { attempts: u64 },

    /// Every nonce was tried for this template's timestamp
    Exhausted,
}

/// Nonce search driver
#[derive(Debug, Clone, Copy)]
pub struct ProofOfWork {
    check_interval: u64,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        ProofOfWork::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl ProofOfWork {
    /// Creates a miner checking for cancellation every `check_interval` nonces
    pub fn new(check_interval: u64) -> Self {
        ProofOfWork {
            check_interval: check_interval.max(1),
        }
    }

    /// Searches nonces from 0 upward until the template's difficulty is met
    ///
    /// # Arguments
    ///
    /// * `template` - The block to seal
    /// * `cancel` - Checked before the first attempt and then every
    ///   `check_interval` attempts
    pub fn mine(&self, template: BlockTemplate, cancel: &CancellationToken) -> MiningOutcome {
        let mut nonce: u64 = 0;

        loop {
            if nonce % self.check_interval == 0 && cancel.is_cancelled() {
                debug!("Mining on {} cancelled after {} attempts", template.parent, nonce);
                return MiningOutcome::Cancelled { attempts: nonce };
            }

            let hash = template.hash_with_nonce(nonce);
            if is_valid(&hash, template.difficulty) {
                return MiningOutcome::Mined(template.seal(nonce));
            }

            nonce = match nonce.checked_add(1) {
                Some(next) => next,
                None => return MiningOutcome::Exhausted,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::StateStore;

    fn template(difficulty: u32) -> BlockTemplate {
        let genesis = Block::genesis(0, StateStore::new());
        BlockTemplate::new(&genesis, difficulty, Vec::new(), StateStore::new())
    }

    #[test]
    fn test_difficulty_zero_accepts_nonce_zero() {
        let outcome = ProofOfWork::default().mine(template(0), &CancellationToken::new());

        match outcome {
            MiningOutcome::Mined(block) => {
                assert_eq!(block.nonce, 0);
                assert!(is_valid(&block.hash, 0));
            }
            other => panic!("expected a mined block, got {:?}", other),
        }
    }

    #[test]
    fn test_mined_block_meets_difficulty() {
        for difficulty in 1..=2 {
            let outcome = ProofOfWork::new(16).mine(template(difficulty), &CancellationToken::new());
            let MiningOutcome::Mined(block) = outcome else {
                panic!("mining at difficulty {} did not finish", difficulty);
            };

            assert!(is_valid(&block.hash, difficulty));
            assert!(block.hash.leading_zero_digits() >= difficulty);
            assert_eq!(block.hash, block.calculate_hash());
        }
    }

    #[test]
    fn test_is_valid_threshold() {
        let mut bytes = [0xaau8; 32];
        bytes[0] = 0x00;
        bytes[1] = 0x0a;
        let hash = BlockHash(bytes);

        assert!(is_valid(&hash, 0));
        assert!(is_valid(&hash, 3));
        assert!(!is_valid(&hash, 4));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ProofOfWork::default().mine(template(64), &cancel);
        assert_eq!(outcome, MiningOutcome::Cancelled { attempts: 0 });
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let cancel = CancellationToken::new();
        let miner_token = cancel.child_token();

        // Difficulty 64 is unreachable, so only cancellation ends the search
        let handle = std::thread::spawn(move || ProofOfWork::new(8).mine(template(64), &miner_token));
        std::thread::sleep(std::time::Duration::from_millis(20));
        cancel.cancel();

        let outcome = handle.join().unwrap();
        assert!(matches!(outcome, MiningOutcome::Cancelled { attempts } if attempts % 8 == 0));
    }
}
