// Blockchain module
//
// This module contains the consensus core:
// - Block hashing and proof of work
// - Accounts and the state transition function
// - Block validation
// - The block tree and GHOST fork choice
// - The ledger tying them together
// - Block persistence

pub mod account;
pub mod block;
pub mod ghost;
pub mod hash;
pub mod ledger;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod tree;
pub mod validation;

// Re-export main components for easier access
pub use account::{Account, Address, Amount, StateStore};
pub use block::Block;
pub use hash::BlockHash;
pub use ledger::{Ledger, LedgerError, MineOutcome, ReceiveOutcome};
pub use transaction::Transaction;
pub use validation::Rejection;
