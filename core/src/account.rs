//! Online-account records broadcast between nodes.

use serde::{Deserialize, Serialize};

/// Proof that an account was online during a timestamp window.
///
/// The network layer forwards these opaquely; signature verification is the
/// controller's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineAccountData {
    pub timestamp: i64,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl OnlineAccountData {
    pub fn new(timestamp: i64, signature: Vec<u8>, public_key: Vec<u8>) -> Self {
        OnlineAccountData {
            timestamp,
            signature,
            public_key,
        }
    }
}
