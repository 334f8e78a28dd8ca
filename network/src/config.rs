//! Network configuration and protocol constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version this node speaks. Peers advertising an older version are
/// spoken to in their dialect (see `Peer::version`).
pub const PROTOCOL_VERSION: u32 = 2;

/// Default peer-to-peer listen port on mainnet.
pub const DEFAULT_PORT: u16 = 10392;

/// Default peer-to-peer listen port on testnet.
pub const TESTNET_PORT: u16 = 20392;

/// Listen socket backlog.
pub const LISTEN_BACKLOG: i32 = 10;

/// How long before retrying after a connection failure, in milliseconds.
pub const CONNECT_FAILURE_BACKOFF: i64 = 5 * 60 * 1000;

/// How long between informational broadcasts to all connected peers, in milliseconds.
pub const BROADCAST_INTERVAL: i64 = 60 * 1000;

/// Maximum time since last successful connection for peer info to be propagated, in milliseconds.
pub const RECENT_CONNECTION_THRESHOLD: i64 = 24 * 60 * 60 * 1000;

/// Maximum time since last connection attempt before a peer is potentially considered "old", in milliseconds.
pub const OLD_PEER_ATTEMPTED_PERIOD: i64 = 24 * 60 * 60 * 1000;

/// Maximum time since last successful connection before a peer is potentially considered "old", in milliseconds.
pub const OLD_PEER_CONNECTION_PERIOD: i64 = 7 * 24 * 60 * 60 * 1000;

/// Maximum time allowed for a handshake to complete, in milliseconds.
pub const HANDSHAKE_TIMEOUT: i64 = 60 * 1000;

/// How often the produce loop considers pruning, in milliseconds.
pub const PRUNE_INTERVAL: i64 = 5 * 60 * 1000;

/// Idle time on a handshaked connection before we ping, in milliseconds.
pub const PING_INTERVAL: i64 = 30 * 1000;

/// How long to wait for a ping reply before giving up on the peer.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for an outbound TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for request/reply exchanges.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a send may wait on a full write queue before the peer is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the blocking wait in the produce loop's channel step.
pub const CHANNEL_SELECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Configuration for the networking subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port the listen socket binds to. `0` lets the OS pick (tests).
    pub listen_port: u16,

    /// Address the listen socket binds to.
    pub bind_address: String,

    /// Whether this node runs on testnet (selects magic and default port).
    pub testnet: bool,

    /// Outbound handshaked connections to maintain.
    pub min_outbound_peers: usize,

    /// Hard cap on simultaneous connections, inbound included.
    pub max_peers: usize,

    /// Bootstrap peers installed into an empty repository at startup.
    pub initial_peers: Vec<String>,

    /// Lower bound of the per-peer delay while broadcasting, in milliseconds.
    pub broadcast_delay_min_ms: u64,

    /// Upper bound of the per-peer delay while broadcasting, in milliseconds.
    pub broadcast_delay_max_ms: u64,

    /// Worker pool floor for the network processor.
    pub min_network_workers: usize,

    /// Worker pool ceiling for the network processor.
    pub max_network_workers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listen_port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            testnet: false,
            min_outbound_peers: 8,
            max_peers: 32,
            initial_peers: vec![
                "node1.quartz.network".to_string(),
                "node2.quartz.network".to_string(),
                "node3.quartz.network".to_string(),
                "node4.quartz.network".to_string(),
            ],
            broadcast_delay_min_ms: 20,
            broadcast_delay_max_ms: 40,
            min_network_workers: 1,
            max_network_workers: 10,
        }
    }
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration suitable for tests: loopback only, OS-assigned port,
    /// no bootstrap peers, minimal broadcast delays.
    pub fn for_testing() -> Self {
        NetworkConfig {
            listen_port: 0,
            bind_address: "127.0.0.1".to_string(),
            testnet: true,
            min_outbound_peers: 1,
            max_peers: 8,
            initial_peers: Vec::new(),
            broadcast_delay_min_ms: 1,
            broadcast_delay_max_ms: 2,
            min_network_workers: 1,
            max_network_workers: 4,
        }
    }

    /// Default port peers of this network listen on, used when a peer
    /// address omits one.
    pub fn default_peer_port(&self) -> u16 {
        if self.testnet {
            TESTNET_PORT
        } else {
            DEFAULT_PORT
        }
    }
}
