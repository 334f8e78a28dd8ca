//! Minimal block metadata exchanged between nodes.

use serde::{Deserialize, Serialize};

use crate::{BLOCK_SIGNATURE_LENGTH, PUBLIC_KEY_LENGTH};

/// Summary of a chain tip: everything a peer needs to decide whether it is
/// ahead of or behind us, without shipping the block itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u32,
    pub signature: Vec<u8>,
    pub timestamp: i64,
    pub minter_public_key: Vec<u8>,
}

impl BlockSummary {
    pub fn new(height: u32, signature: Vec<u8>, timestamp: i64, minter_public_key: Vec<u8>) -> Self {
        BlockSummary {
            height,
            signature,
            timestamp,
            minter_public_key,
        }
    }

    /// Whether the summary carries well-formed signature and key material.
    pub fn is_well_formed(&self) -> bool {
        self.signature.len() == BLOCK_SIGNATURE_LENGTH
            && self.minter_public_key.len() == PUBLIC_KEY_LENGTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_summary() {
        let summary = BlockSummary::new(
            7,
            vec![0xab; BLOCK_SIGNATURE_LENGTH],
            1_700_000_000_000,
            vec![0xcd; PUBLIC_KEY_LENGTH],
        );
        assert!(summary.is_well_formed());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let summary = BlockSummary::new(7, vec![0xab; 16], 1_700_000_000_000, vec![0xcd; 32]);
        assert!(!summary.is_well_formed());
    }
}
