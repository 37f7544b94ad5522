//! Gossip payloads exchanged between nodes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::block::Block;

/// Errors that can occur while encoding or decoding gossip
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(serde_json::Error),
}

/// A block or chain snapshot announced by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum GossipMessage {
    /// A single new block
    Block(Block),

    /// Several blocks in any order, typically a canonical chain
    Chain(Vec<Block>),
}

impl GossipMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }

    /// Number of blocks carried
    pub fn len(&self) -> usize {
        match self {
            GossipMessage::Block(_) => 1,
            GossipMessage::Chain(blocks) => blocks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_blocks(self) -> Vec<Block> {
        match self {
            GossipMessage::Block(block) => vec![block],
            GossipMessage::Chain(blocks) => blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::{Address, StateStore};

    fn genesis() -> Block {
        Block::genesis(0, StateStore::with_allocations([(Address::from("main"), 10)]))
    }

    #[test]
    fn test_wire_format_is_tagged_json() {
        let message = GossipMessage::Block(genesis());
        let bytes = message.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["kind"], "block");
        assert_eq!(value["payload"]["hash"], genesis().hash.to_hex());
        assert_eq!(value["payload"]["resulting_state"]["main"]["balance"], 10);
        assert_eq!(GossipMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_into_blocks() {
        let chain = GossipMessage::Chain(vec![genesis(), genesis()]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.into_blocks().len(), 2);

        assert!(GossipMessage::Chain(Vec::new()).is_empty());
        assert_eq!(GossipMessage::Block(genesis()).into_blocks(), vec![genesis()]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            GossipMessage::decode(b"not json"),
            Err(MessageError::Decode(_))
        ));
        assert!(GossipMessage::decode(br#"{"kind":"tx","payload":{}}"#).is_err());
    }
}
