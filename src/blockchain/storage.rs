use std::path::Path;

use log::warn;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::hash::{BlockHash, HASH_LEN};

const TIP_KEY: &str = "canonical_tip";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Durable record of every accepted block
///
/// Blocks are stored by hash with no ordering; on startup they are replayed
/// through the ledger, which revalidates them and recomputes the tip.
pub struct BlockStore {
    /// The database instance
    db: Db,

    /// Tree for blocks, keyed by hash
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlockStore {
    /// Opens (or creates) a block store
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a store that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            blocks,
            metadata,
        })
    }

    /// Saves a block, overwriting any earlier copy with the same hash
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.blocks.insert(block.hash.as_bytes(), value)?;
        Ok(())
    }

    pub fn contains(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(hash.as_bytes())?)
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(hash.as_bytes())? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    /// Loads every stored block in no particular order
    ///
    /// Undecodable entries are skipped with a warning unless nothing at all
    /// could be decoded.
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            match bincode::deserialize::<Block>(&value) {
                Ok(block) => blocks.push(block),
                Err(e) => deserialization_errors.push(format!(
                    "Failed to deserialize block {}: {}",
                    hex::encode(key.as_ref()),
                    e
                )),
            }
        }

        if !deserialization_errors.is_empty() {
            if blocks.is_empty() {
                return Err(StorageError::DeserializationError(format!(
                    "Failed to deserialize any blocks: {}",
                    deserialization_errors.join(", ")
                )));
            }
            warn!(
                "Some blocks could not be deserialized: {}",
                deserialization_errors.join(", ")
            );
        }

        Ok(blocks)
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Records the canonical tip seen when the node last changed it
    pub fn save_tip(&self, tip: &BlockHash) -> Result<(), StorageError> {
        self.metadata.insert(TIP_KEY, tip.as_bytes().as_slice())?;
        Ok(())
    }

    /// Gets the last recorded canonical tip
    pub fn load_tip(&self) -> Result<Option<BlockHash>, StorageError> {
        match self.metadata.get(TIP_KEY)? {
            Some(value) => {
                let bytes: [u8; HASH_LEN] = value.as_ref().try_into().map_err(|_| {
                    StorageError::DeserializationError(format!(
                        "Stored tip has {} bytes",
                        value.len()
                    ))
                })?;
                Ok(Some(BlockHash(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
