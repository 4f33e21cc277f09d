//! In-process manifest cache and commit serialization.
//!
//! Wraps a [`ManifestManager`] with two things every caller in this process
//! shares: an [`nbs_tools::lru_cache::LruCache`] of manifest snapshots keyed
//! by root hash (so a rebase that lands back on a recently-seen root skips
//! the filesystem read), and a commit mutex that serializes this process's
//! own commit attempts before they ever reach the cross-process CAS. The
//! mutex is pure optimization: two threads in the same process racing the
//! manifest update would just thrash retries against each other's
//! [`nbs_tools::process_locker::ProcessLocker`] lock, so funnel them through
//! one at a time locally first.

use std::sync::{Arc, Mutex};

use anyhow::Error;

use nbs_tools::lru_cache::LruCache;

use crate::error::CommitError;
use crate::hash::Address;
use crate::manifest::{ManifestContents, ManifestManager};
use crate::table::TableSpec;

pub struct ManifestCache {
    manager: Arc<dyn ManifestManager>,
    cache: Mutex<LruCache<Address, Arc<ManifestContents>>>,
    commit_lock: Mutex<()>,
}

impl ManifestCache {
    pub fn new(manager: Arc<dyn ManifestManager>, capacity: usize) -> Self {
        ManifestCache {
            manager,
            cache: Mutex::new(LruCache::new(capacity)),
            commit_lock: Mutex::new(()),
        }
    }

    /// Fetch the manifest, preferring a cached snapshot keyed by the
    /// backend's notion of "current" only when no update is in flight.
    /// Callers that need the authoritative current state (e.g. before a
    /// commit's CAS) should call [`Self::fetch_authoritative`] instead.
    pub fn fetch_authoritative(&self) -> Result<Arc<ManifestContents>, Error> {
        let contents = Arc::new(self.manager.fetch()?);
        self.cache.lock().unwrap().insert(contents.root, contents.clone());
        Ok(contents)
    }

    pub fn fetch_cached(&self, root: Address) -> Option<Arc<ManifestContents>> {
        self.cache.lock().unwrap().get_mut(root).cloned()
    }

    /// Run a commit attempt against the manifest. Serializes with other
    /// in-process commits, then delegates to the backing
    /// [`ManifestManager`]'s cross-process CAS.
    pub fn commit(
        &self,
        expected_lock: Address,
        new_root: Address,
        new_specs: Vec<TableSpec>,
    ) -> Result<Arc<ManifestContents>, CommitError> {
        let _serialize = self.commit_lock.lock().unwrap();
        let updated = self.manager.update(expected_lock, new_root, new_specs)?;
        let updated = Arc::new(updated);
        self.cache.lock().unwrap().insert(updated.root, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingManager {
        fetches: AtomicUsize,
        contents: Mutex<ManifestContents>,
    }

    impl ManifestManager for CountingManager {
        fn fetch(&self) -> Result<ManifestContents, Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.contents.lock().unwrap().clone())
        }

        fn update(
            &self,
            expected_lock: Address,
            new_root: Address,
            new_specs: Vec<TableSpec>,
        ) -> Result<ManifestContents, CommitError> {
            let mut guard = self.contents.lock().unwrap();
            if guard.lock != expected_lock {
                return Err(CommitError::OptimisticLockFailed);
            }
            guard.root = new_root;
            guard.specs = new_specs;
            guard.lock = Address::hash(guard.root.as_bytes());
            Ok(guard.clone())
        }
    }

    #[test]
    fn commit_updates_the_cache() {
        let manager = Arc::new(CountingManager {
            fetches: AtomicUsize::new(0),
            contents: Mutex::new(ManifestContents::empty(Address::zero())),
        });
        let cache = ManifestCache::new(manager.clone(), 4);
        let current = cache.fetch_authoritative().unwrap();
        let new_root = Address::hash(b"new root");
        let updated = cache.commit(current.lock, new_root, vec![]).unwrap();
        assert_eq!(updated.root, new_root);
        assert!(cache.fetch_cached(new_root).is_some());
    }

    #[test]
    fn stale_lock_is_rejected() {
        let manager = Arc::new(CountingManager {
            fetches: AtomicUsize::new(0),
            contents: Mutex::new(ManifestContents::empty(Address::zero())),
        });
        let cache = ManifestCache::new(manager, 4);
        let stale = Address::hash(b"stale");
        let err = cache.commit(stale, Address::hash(b"root"), vec![]).unwrap_err();
        assert!(matches!(err, CommitError::OptimisticLockFailed));
    }
}
