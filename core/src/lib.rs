//! Chain-level value types for the Quartz node.
//!
//! The networking layer carries these around without interpreting them;
//! validation and storage live elsewhere in the node.

pub mod account;
pub mod block;
pub mod params;

pub use account::OnlineAccountData;
pub use block::BlockSummary;
pub use params::ChainParams;

/// Length of a block signature in bytes.
pub const BLOCK_SIGNATURE_LENGTH: usize = 128;

/// Length of a transaction signature in bytes.
pub const TRANSACTION_SIGNATURE_LENGTH: usize = 64;

/// Length of an account public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// A transaction signature, the network-wide identifier for a transaction.
pub type TransactionSignature = [u8; TRANSACTION_SIGNATURE_LENGTH];
