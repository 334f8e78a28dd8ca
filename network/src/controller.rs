//! Seams to the rest of the node.
//!
//! The network layer never reaches into the controller or the wall clock
//! directly; both are injected at construction so tests can supply their
//! own. There are no process-wide singletons here.

use std::sync::Arc;

use quartz_core::{BlockSummary, OnlineAccountData};

use crate::manager::NetworkManager;
use crate::message::Message;
use crate::peer::Peer;

/// Synchronised wall clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since the epoch, or `None` while time is not yet
    /// synchronised. Scheduled network actions no-op on `None`.
    fn now(&self) -> Option<i64>;
}

/// Clock backed by the operating system, assumed synchronised.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Option<i64> {
        Some(chrono::Utc::now().timestamp_millis())
    }
}

/// The node-level consumer of network events.
///
/// Callbacks run on network worker tasks and must not block for long;
/// anything slow should be handed off inside the controller.
pub trait Controller: Send + Sync {
    /// A peer has gone away. Called exactly once per connection.
    fn on_peer_disconnect(&self, peer: &Arc<Peer>);

    /// A peer finished handshaking and is ready for general traffic.
    fn on_peer_handshake_completed(&self, network: &Arc<NetworkManager>, peer: &Arc<Peer>);

    /// A non-network-level message arrived on a handshaked peer.
    fn on_network_message(&self, network: &Arc<NetworkManager>, peer: &Arc<Peer>, message: Message);

    /// Periodic invitation to broadcast; the controller calls
    /// `network.broadcast(...)` with whatever it wants to send.
    fn do_network_broadcast(&self, network: &Arc<NetworkManager>);

    /// Current chain tip, used for HEIGHT messages.
    fn chain_tip(&self) -> BlockSummary;

    /// Accounts known online, for controller-built broadcasts.
    fn online_accounts(&self) -> Vec<OnlineAccountData>;
}
