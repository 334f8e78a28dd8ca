//! Peer persistence seam.
//!
//! The node's storage engine sits behind `PeerRepository`; the network layer
//! only ever sees this trait. Writes are staged and become durable at
//! `save_changes`, mirroring how the node's repositories work elsewhere.
//!
//! Acquisition comes in two flavours, and the distinction is load-bearing:
//! `try_repository` gives up immediately when the store is busy so that
//! opportunistic paths (pruning, merging) never pile up behind block
//! processing, while `repository().await` waits and is reserved for the few
//! paths that genuinely need the write.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::address::PeerAddress;
use crate::peer_info::PeerData;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("peer store failure: {0}")]
    Storage(String),
}

/// Staged-write view over the node's peer store.
pub trait PeerRepository: Send {
    /// All known peers, staged changes included.
    fn get_all_peers(&self) -> Result<Vec<PeerData>, RepositoryError>;

    /// Stage an insert-or-replace keyed by unresolved address.
    fn save(&mut self, peer: &PeerData) -> Result<(), RepositoryError>;

    /// Stage deletion of one address; returns how many records it will remove.
    fn delete(&mut self, address: &PeerAddress) -> Result<u32, RepositoryError>;

    /// Stage deletion of every record; returns how many it will remove.
    fn delete_all(&mut self) -> Result<u32, RepositoryError>;

    /// Make staged changes durable.
    fn save_changes(&mut self) -> Result<(), RepositoryError>;

    /// Drop staged changes.
    fn discard_changes(&mut self);
}

/// Exclusive handle on the peer store.
pub type RepositoryHandle = OwnedMutexGuard<Box<dyn PeerRepository>>;

/// Hands out exclusive repository handles, either opportunistically or
/// blocking.
#[derive(Clone)]
pub struct RepositoryManager {
    inner: Arc<Mutex<Box<dyn PeerRepository>>>,
}

impl RepositoryManager {
    pub fn new(repository: Box<dyn PeerRepository>) -> Self {
        RepositoryManager {
            inner: Arc::new(Mutex::new(repository)),
        }
    }

    /// Non-blocking acquire; `None` means the store is busy and the caller
    /// should skip its work rather than queue.
    pub fn try_repository(&self) -> Option<RepositoryHandle> {
        self.inner.clone().try_lock_owned().ok()
    }

    /// Blocking acquire, for paths that must complete.
    pub async fn repository(&self) -> RepositoryHandle {
        self.inner.clone().lock_owned().await
    }
}

enum Change {
    Save(PeerData),
    Delete(PeerAddress),
    DeleteAll,
}

/// In-memory `PeerRepository`, used by tests and embedders without a
/// database. Staged changes are visible to reads on the same handle, as
/// they would be inside a database transaction.
#[derive(Default)]
pub struct MemoryPeerRepository {
    committed: HashMap<PeerAddress, PeerData>,
    staged: Vec<Change>,
}

impl MemoryPeerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn projected(&self) -> HashMap<PeerAddress, PeerData> {
        let mut view = self.committed.clone();
        for change in &self.staged {
            match change {
                Change::Save(peer) => {
                    view.insert(peer.address().clone(), peer.clone());
                }
                Change::Delete(address) => {
                    view.remove(address);
                }
                Change::DeleteAll => view.clear(),
            }
        }
        view
    }
}

impl PeerRepository for MemoryPeerRepository {
    fn get_all_peers(&self) -> Result<Vec<PeerData>, RepositoryError> {
        Ok(self.projected().into_values().collect())
    }

    fn save(&mut self, peer: &PeerData) -> Result<(), RepositoryError> {
        self.staged.push(Change::Save(peer.clone()));
        Ok(())
    }

    fn delete(&mut self, address: &PeerAddress) -> Result<u32, RepositoryError> {
        let removed = u32::from(self.projected().contains_key(address));
        self.staged.push(Change::Delete(address.clone()));
        Ok(removed)
    }

    fn delete_all(&mut self) -> Result<u32, RepositoryError> {
        let removed = self.projected().len() as u32;
        self.staged.push(Change::DeleteAll);
        Ok(removed)
    }

    fn save_changes(&mut self) -> Result<(), RepositoryError> {
        self.committed = self.projected();
        self.staged.clear();
        Ok(())
    }

    fn discard_changes(&mut self) {
        self.staged.clear();
    }
}
