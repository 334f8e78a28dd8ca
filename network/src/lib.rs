//! Quartz peer-to-peer networking layer.
//!
//! Discovers peers, runs the multi-stage handshake (with self-connect
//! detection and doppelganger verification), multiplexes framed messages
//! over per-peer connections, and hands completed traffic to the node's
//! controller. Storage and chain logic stay behind the narrow
//! [`repository::PeerRepository`] and [`controller::Controller`] seams.

pub mod address;
pub mod codec;
pub mod config;
pub mod controller;
pub mod epc;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod peer;
pub mod peer_info;
pub mod repository;

pub use address::{is_address_local, PeerAddress};
pub use codec::{FrameCodec, MAINNET_MAGIC, TESTNET_MAGIC};
pub use config::{NetworkConfig, PROTOCOL_VERSION};
pub use controller::{Clock, Controller, SystemClock};
pub use epc::{ExecuteProduceConsume, TaskProducer};
pub use error::{HandshakeError, NetworkError, NetworkResult, ProtocolError};
pub use handshake::{Direction, HandshakeState};
pub use manager::NetworkManager;
pub use message::{Message, MessageType, Payload, PeerId, PEER_ID_LENGTH};
pub use peer::Peer;
pub use peer_info::PeerData;
pub use repository::{MemoryPeerRepository, PeerRepository, RepositoryError, RepositoryManager};
