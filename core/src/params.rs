//! Consensus-level parameters the rest of the node reads but never writes.

use serde::{Deserialize, Serialize};

/// Parameters fixed per chain (mainnet / testnet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    /// Upper bound on a serialised block, in bytes. Bounds the network
    /// layer's maximum message size.
    pub max_block_size: usize,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        ChainParams {
            max_block_size: 1024 * 1024,
        }
    }

    pub fn testnet() -> Self {
        ChainParams {
            max_block_size: 1024 * 1024,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
