use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

/// Content hash of a block, computed over the serialized header.
///
/// Displayed in base58, like every hash a node operator ever has to read.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const LENGTH: usize = 32;

    /// Hashes arbitrary bytes with SHA-256.
    pub fn hash_bytes(bytes: &[u8]) -> Self {
        Self(sha2::Sha256::digest(bytes).into())
    }

    /// Hashes the borsh serialization of a value.
    pub fn hash_borsh<T: BorshSerialize>(value: &T) -> Self {
        let mut hasher = sha2::Sha256::new();
        value.serialize(&mut hasher).expect("hasher never fails");
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseHashError {
    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("decoded hash has {0} bytes, expected 32")]
    BadLength(usize),
}

impl FromStr for BlockHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let bytes: [u8; 32] =
            bytes.try_into().map_err(|v: Vec<u8>| ParseHashError::BadLength(v.len()))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        let hash = BlockHash::hash_bytes(b"weft");
        let parsed: BlockHash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn borsh_hash_matches_bytes_hash() {
        // Borsh of a Vec<u8> is length-prefixed, so the two digests differ.
        let bytes = b"payload".to_vec();
        assert_ne!(BlockHash::hash_borsh(&bytes), BlockHash::hash_bytes(&bytes));
    }
}
