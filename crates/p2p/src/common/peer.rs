//! Persisted peer records and the repository they live in.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use quill_types::PeerAddress;

use crate::net::LocalTime;

/// A peer record owned by the repository.
///
/// `first_seen <= last_attempted`, and `last_connected <=
/// last_attempted` whenever both are present: a connection is always
/// preceded by an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
    pub address: PeerAddress,
    pub first_seen: LocalTime,
    pub last_attempted: Option<LocalTime>,
    pub last_connected: Option<LocalTime>,
    /// Where this record came from, eg. another peer's address or
    /// `"INIT"` for the built-in list.
    pub added_by: String,
}

impl PeerData {
    pub fn new(address: PeerAddress, first_seen: LocalTime, added_by: impl Into<String>) -> Self {
        Self {
            address,
            first_seen,
            last_attempted: None,
            last_connected: None,
            added_by: added_by.into(),
        }
    }
}

/// A failure inside the repository implementation.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct RepositoryError(pub String);

/// A unit-of-work over the persisted peer set. Mutations are staged
/// until `save_changes`.
pub trait PeerRepository {
    fn get_all_peers(&self) -> Result<Vec<PeerData>, RepositoryError>;

    /// Stage an insert-or-update keyed by unresolved address.
    fn save(&mut self, peer: &PeerData) -> Result<(), RepositoryError>;

    /// Stage a delete. Returns the number of records affected.
    fn delete(&mut self, address: &PeerAddress) -> Result<u32, RepositoryError>;

    fn delete_all(&mut self) -> Result<u32, RepositoryError>;

    fn save_changes(&mut self) -> Result<(), RepositoryError>;

    fn discard_changes(&mut self);
}

/// Hands out repository handles.
///
/// `try_repository` giving up when an instance is busy is a first-class
/// contract: opportunistic paths (pruning, merging, broadcasts) rely on
/// it to avoid priority inversions.
pub trait RepositoryFactory: Send + Sync + 'static {
    /// A handle, or `None` if one cannot be had without blocking.
    fn try_repository(&self) -> Option<Box<dyn PeerRepository + '_>>;

    /// A handle, waiting for one if necessary.
    fn repository(&self) -> Box<dyn PeerRepository + '_>;
}

/// In-memory repository. Backs tests and nodes run without a database.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    peers: Mutex<HashMap<PeerAddress, PeerData>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RepositoryFactory for MemoryRepository {
    fn try_repository(&self) -> Option<Box<dyn PeerRepository + '_>> {
        let committed = self.peers.try_lock().ok()?;
        Some(Box::new(MemoryHandle::new(committed)))
    }

    fn repository(&self) -> Box<dyn PeerRepository + '_> {
        let committed = self.peers.lock().expect("repository lock is never poisoned");
        Box::new(MemoryHandle::new(committed))
    }
}

struct MemoryHandle<'a> {
    committed: MutexGuard<'a, HashMap<PeerAddress, PeerData>>,
    working: HashMap<PeerAddress, PeerData>,
}

impl<'a> MemoryHandle<'a> {
    fn new(committed: MutexGuard<'a, HashMap<PeerAddress, PeerData>>) -> Self {
        let working = committed.clone();
        Self { committed, working }
    }
}

impl PeerRepository for MemoryHandle<'_> {
    fn get_all_peers(&self) -> Result<Vec<PeerData>, RepositoryError> {
        Ok(self.working.values().cloned().collect())
    }

    fn save(&mut self, peer: &PeerData) -> Result<(), RepositoryError> {
        self.working.insert(peer.address.clone(), peer.clone());
        Ok(())
    }

    fn delete(&mut self, address: &PeerAddress) -> Result<u32, RepositoryError> {
        Ok(self.working.remove(address).map_or(0, |_| 1))
    }

    fn delete_all(&mut self) -> Result<u32, RepositoryError> {
        let count = self.working.len() as u32;
        self.working.clear();
        Ok(count)
    }

    fn save_changes(&mut self) -> Result<(), RepositoryError> {
        *self.committed = self.working.clone();
        Ok(())
    }

    fn discard_changes(&mut self) {
        self.working = self.committed.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::parse(s, 12392).unwrap()
    }

    #[test]
    fn changes_are_staged_until_saved() {
        let factory = MemoryRepository::new();
        {
            let mut repo = factory.repository();
            repo.save(&PeerData::new(addr("10.0.0.1"), LocalTime::from_secs(1), "test"))
                .unwrap();
            // Dropped without save_changes.
        }
        assert!(factory.repository().get_all_peers().unwrap().is_empty());

        {
            let mut repo = factory.repository();
            repo.save(&PeerData::new(addr("10.0.0.1"), LocalTime::from_secs(1), "test"))
                .unwrap();
            repo.save_changes().unwrap();
        }
        assert_eq!(factory.repository().get_all_peers().unwrap().len(), 1);
    }

    #[test]
    fn discard_reverts_to_committed_state() {
        let factory = MemoryRepository::new();
        let mut repo = factory.repository();
        repo.save(&PeerData::new(addr("10.0.0.1"), LocalTime::from_secs(1), "test"))
            .unwrap();
        repo.save_changes().unwrap();

        repo.delete_all().unwrap();
        assert!(repo.get_all_peers().unwrap().is_empty());
        repo.discard_changes();
        assert_eq!(repo.get_all_peers().unwrap().len(), 1);
    }

    #[test]
    fn try_repository_yields_nothing_while_contended() {
        let factory = MemoryRepository::new();
        let _held = factory.repository();
        assert!(factory.try_repository().is_none());
    }

    #[test]
    fn delete_reports_affected_records() {
        let factory = MemoryRepository::new();
        let mut repo = factory.repository();
        repo.save(&PeerData::new(addr("10.0.0.1"), LocalTime::from_secs(1), "test"))
            .unwrap();
        assert_eq!(repo.delete(&addr("10.0.0.1")).unwrap(), 1);
        assert_eq!(repo.delete(&addr("10.0.0.1")).unwrap(), 0);
    }
}
