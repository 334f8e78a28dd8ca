//! Persisted peer records.

use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;

/// A known peer as stored in the repository.
///
/// Invariants: `first_seen <= last_attempted` and, when both are present,
/// `last_connected <= last_attempted`. The setters below maintain them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerData {
    address: PeerAddress,
    first_seen: i64,
    last_attempted: Option<i64>,
    last_connected: Option<i64>,
    added_by: String,
}

impl PeerData {
    pub fn new(address: PeerAddress, first_seen: i64, added_by: impl Into<String>) -> Self {
        PeerData {
            address,
            first_seen,
            last_attempted: None,
            last_connected: None,
            added_by: added_by.into(),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn first_seen(&self) -> i64 {
        self.first_seen
    }

    pub fn last_attempted(&self) -> Option<i64> {
        self.last_attempted
    }

    pub fn last_connected(&self) -> Option<i64> {
        self.last_connected
    }

    pub fn added_by(&self) -> &str {
        &self.added_by
    }

    /// Note an outbound connection attempt. Clamped so a skewed clock can't
    /// put the attempt before `first_seen`.
    pub fn record_attempt(&mut self, now: i64) {
        self.last_attempted = Some(now.max(self.first_seen));
    }

    /// Note a completed handshake. A connection implies an attempt, so
    /// `last_attempted` is pulled forward if it lags.
    pub fn record_connection(&mut self, now: i64) {
        let now = now.max(self.first_seen);
        self.last_connected = Some(now);
        if self.last_attempted.map_or(true, |attempted| attempted < now) {
            self.last_attempted = Some(now);
        }
    }

}
