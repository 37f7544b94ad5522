use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use std::fmt;

use super::account::{Address, Amount};

/// Sender signature, opaque to the ledger
///
/// Verification belongs to an external collaborator; the ledger only carries
/// the value through blocks and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct Signature(pub String);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to move `value` from `origin` to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Sender's address
    pub origin: Address,

    /// Recipient's address
    pub destination: Address,

    /// Amount being transferred
    pub value: Amount,

    /// Sender's signature over the transfer
    pub sender_signature: Signature,
}

impl Transaction {
    /// Creates a new transfer
    ///
    /// # Arguments
    ///
    /// * `origin` - The address paying `value`
    /// * `destination` - The address receiving `value`
    /// * `value` - The amount to transfer
    /// * `signature` - The sender's signature, checked elsewhere
    pub fn new(
        origin: Address,
        destination: Address,
        value: Amount,
        signature: impl Into<String>,
    ) -> Self {
        Transaction {
            origin,
            destination,
            value,
            sender_signature: Signature(signature.into()),
        }
    }

    /// Creates a reward transaction crediting a miner
    pub fn reward(miner: Address, amount: Amount) -> Self {
        Transaction {
            origin: Address::reward_origin(),
            destination: miner,
            value: amount,
            sender_signature: Signature::default(),
        }
    }

    /// Checks if the transaction mints a reward
    pub fn is_reward(&self) -> bool {
        self.origin.is_reward_origin()
    }

    /// Checks if the transaction moves funds to its own origin
    pub fn is_self_transfer(&self) -> bool {
        self.origin == self.destination
    }
}
