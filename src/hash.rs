//! Piece hashing and Merkle root computation.
//!
//! Every piece is identified by the lowercase-hex SHA-256 of its bytes. The
//! Merkle root binds the whole piece-hash list into a single digest:
//!
//! 1. Leaves are the piece hashes in index order (raw 32-byte form).
//! 2. Levels are paired left-to-right; an odd trailing node is paired with
//!    itself.
//! 3. Parents are `SHA-256(left || right)` over the raw digests.
//!
//! A single-leaf tree's root is the leaf itself.

use sha2::{Digest, Sha256};

/// Hash a piece of data. Returns the lowercase-hex SHA-256 digest.
pub fn piece_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash two Merkle nodes together.
fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    Sha256::new()
        .chain_update(left)
        .chain_update(right)
        .finalize()
        .into()
}

/// Compute the Merkle root over an ordered list of hex piece hashes.
///
/// Fails on an empty list and on leaves that are not 64-char hex strings.
pub fn merkle_root(hashes: &[String]) -> Result<String, MerkleError> {
    if hashes.is_empty() {
        return Err(MerkleError::EmptyHashes);
    }

    let mut level: Vec<[u8; 32]> = Vec::with_capacity(hashes.len());
    for (index, hash) in hashes.iter().enumerate() {
        let raw = hex::decode(hash).map_err(|_| MerkleError::InvalidLeaf { index })?;
        let leaf: [u8; 32] = raw
            .try_into()
            .map_err(|_| MerkleError::InvalidLeaf { index })?;
        level.push(leaf);
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [l, r] => hash_pair(l, r),
                [l] => hash_pair(l, l), // odd node: pair with itself
                _ => unreachable!(),
            })
            .collect();
    }

    Ok(hex::encode(level[0]))
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors from Merkle root computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// The hash list was empty; a root over nothing is undefined.
    EmptyHashes,
    /// A leaf was not a valid 64-character hex SHA-256 string.
    InvalidLeaf { index: usize },
}

impl std::fmt::Display for MerkleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyHashes => write!(f, "cannot compute Merkle root of an empty hash list"),
            Self::InvalidLeaf { index } => write!(f, "leaf {index} is not a valid hex SHA-256"),
        }
    }
}

impl std::error::Error for MerkleError {}

// ── Tests ────────────────────────────────────────────────────────────────────
