use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Number of bytes in a block hash
pub const HASH_LEN: usize = 32;

/// Errors that can occur when parsing a hash from text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Invalid hash length: expected {HASH_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// A 256-bit block fingerprint
///
/// Serialized as a lowercase hex string so that snapshots exchanged between
/// nodes stay human readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; HASH_LEN]);

impl BlockHash {
    /// Returns the raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Returns the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Counts the leading `'0'` characters of the hex representation
    pub fn leading_zero_digits(&self) -> u32 {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 2;
                continue;
            }
            if byte >> 4 == 0 {
                zeros += 1;
            }
            break;
        }
        zeros
    }

    /// Returns a copy of the hash with a single bit flipped
    pub fn with_bit_flipped(&self, bit: usize) -> Self {
        let mut bytes = self.0;
        let index = (bit / 8) % HASH_LEN;
        bytes[index] ^= 1 << (bit % 8);
        BlockHash(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex digits are plenty to tell blocks apart in logs
        write!(f, "BlockHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for BlockHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
        let len = bytes.len();
        let array: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| HashParseError::InvalidLength(len))?;
        Ok(BlockHash(array))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes the fingerprint of a block header
///
/// The preimage is a fixed-width big-endian encoding of
/// `nonce (8) || timestamp (8) || parent flag (1) || parent hash (32)`.
/// A missing parent encodes as a zero flag followed by zero bytes, so a root
/// block can never collide with a child of an all-zero hash.
pub fn fingerprint(nonce: u64, timestamp: i64, parent: Option<&BlockHash>) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    match parent {
        Some(parent) => {
            hasher.update([1u8]);
            hasher.update(parent.as_bytes());
        }
        None => {
            hasher.update([0u8]);
            hasher.update([0u8; HASH_LEN]);
        }
    }
    BlockHash(hasher.finalize().into())
}
