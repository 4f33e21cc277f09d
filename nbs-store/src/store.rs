//! `NomsBlockStore`: the public façade tying memtable, table set, conjoiner
//! and manifest together.
//!
//! A single struct wrapping a mutex-guarded mutable core plus a handful of
//! shared, independently-lockable caches. Dedup-on-insert happens here,
//! before anything touches disk.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};
use log::{debug, info};

use crate::cache::index_cache::IndexCache;
use crate::chunk::Chunk;
use crate::conjoin::Conjoiner;
use crate::config::StoreConfig;
use crate::error::CommitError;
use crate::hash::Address;
use crate::manifest::{LocalManifestManager, ManifestContents, ManifestManager};
use crate::manifest_cache::ManifestCache;
use crate::memtable::{AddOutcome, Memtable};
use crate::persister::local::LocalPersister;
use crate::persister::Persister;
use crate::stats::StoreStats;
use crate::table::writer::build_table_with_spec;
use crate::table_set::TableSet;

struct StoreState {
    memtable: Memtable,
    table_set: TableSet,
    last_manifest: Arc<ManifestContents>,
}

/// A content-addressed chunk store with table-file persistence and a
/// manifest-based root of trust.
pub struct NomsBlockStore {
    config: StoreConfig,
    manifest_cache: Arc<ManifestCache>,
    state: Mutex<StoreState>,
    stats: Mutex<StoreStats>,
}

impl NomsBlockStore {
    /// Open (or initialize) a store rooted at `base_dir` on the local
    /// filesystem.
    pub fn open_local(base_dir: PathBuf, config: StoreConfig) -> Result<Self, Error> {
        let persister: Arc<dyn Persister> =
            Arc::new(LocalPersister::new(base_dir.join("tables")).context("opening local table storage")?);
        let manager: Arc<dyn ManifestManager> =
            Arc::new(LocalManifestManager::new(&base_dir.join("manifest")).context("opening manifest")?);
        Self::open_with_backends(persister, manager, config)
    }

    pub fn open_with_backends(
        persister: Arc<dyn Persister>,
        manager: Arc<dyn ManifestManager>,
        config: StoreConfig,
    ) -> Result<Self, Error> {
        let manifest_cache = Arc::new(ManifestCache::new(manager, config.manifest_cache_size));
        let last_manifest = manifest_cache.fetch_authoritative()?;
        let index_cache = Arc::new(IndexCache::new(index_cache_entry_budget(&config)));
        let table_set = TableSet::new(persister, index_cache, last_manifest.specs.clone())?;

        info!(
            "opened store at root {} with {} table(s)",
            last_manifest.root,
            table_set.count()
        );

        Ok(NomsBlockStore {
            config,
            manifest_cache,
            state: Mutex::new(StoreState {
                memtable: Memtable::new(config.mem_table_size),
                table_set,
                last_manifest,
            }),
            stats: Mutex::new(StoreStats::new()),
        })
    }

    /// Buffer `chunk` for later persistence, deduplicating against
    /// anything already known to this store (memtable, novel, or upstream).
    pub fn put(&self, chunk: Chunk) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.memtable.has(&chunk.address()) || state.table_set.has(&chunk.address()) {
            self.stats.lock().unwrap().record_write(chunk.len(), true);
            return Ok(());
        }

        let len = chunk.len();
        loop {
            match state.memtable.add(chunk.clone()) {
                AddOutcome::Added | AddOutcome::AlreadyPresent => break,
                AddOutcome::Full => self.flush_locked(&mut state)?,
            }
        }
        self.stats.lock().unwrap().record_write(len, false);
        Ok(())
    }

    pub fn has(&self, addr: &Address) -> bool {
        let state = self.state.lock().unwrap();
        state.memtable.has(addr) || state.table_set.has(addr)
    }

    /// Returns the subset of `addrs` absent from this store.
    pub fn has_many(&self, addrs: &[Address]) -> HashSet<Address> {
        let state = self.state.lock().unwrap();
        let still_missing: Vec<Address> = addrs.iter().copied().filter(|a| !state.memtable.has(a)).collect();
        state.table_set.has_many(&still_missing)
    }

    pub fn get(&self, addr: &Address) -> Result<Option<Chunk>, Error> {
        let state = self.state.lock().unwrap();
        if let Some(chunk) = state.memtable.get(addr) {
            self.stats.lock().unwrap().record_read(chunk.len());
            return Ok(Some(chunk.clone()));
        }
        let found = state.table_set.get(addr)?;
        if let Some(chunk) = &found {
            self.stats.lock().unwrap().record_physical_read();
            self.stats.lock().unwrap().record_read(chunk.len());
        }
        Ok(found)
    }

    /// Fetch every address in `addrs` that this store has, returning the
    /// found chunks and the set that was absent.
    pub fn get_many(&self, addrs: &[Address]) -> Result<(Vec<Chunk>, HashSet<Address>), Error> {
        let state = self.state.lock().unwrap();
        let mut found = Vec::new();
        let mut remaining = Vec::new();
        for addr in addrs {
            match state.memtable.get(addr) {
                Some(chunk) => found.push(chunk.clone()),
                None => remaining.push(*addr),
            }
        }
        let (mut table_found, absent) = state.table_set.get_many(&remaining)?;
        let mut stats = self.stats.lock().unwrap();
        for chunk in table_found.iter().chain(found.iter()) {
            stats.record_read(chunk.len());
        }
        drop(stats);
        found.append(&mut table_found);
        Ok((found, absent))
    }

    /// For each found address, the name of the table file holding it
    /// (omitted if only present in the memtable, since it has no table
    /// identity yet).
    pub fn get_chunk_locations(&self, addrs: &[Address]) -> HashMap<Address, Address> {
        let state = self.state.lock().unwrap();
        let remaining: Vec<Address> = addrs.iter().copied().filter(|a| !state.memtable.has(a)).collect();
        let (locations, _absent) = state.table_set.locate_many(&remaining);
        locations
    }

    /// The root hash as of this process's last successful commit or
    /// rebase. May lag another writer's more recent commit until
    /// [`Self::rebase`] or [`Self::commit`] is called.
    pub fn root(&self) -> Address {
        self.state.lock().unwrap().last_manifest.root
    }

    /// Refresh this store's view of the manifest without attempting to
    /// write anything. Returns the (possibly unchanged) current root.
    pub fn rebase(&self) -> Result<Address, Error> {
        let mut state = self.state.lock().unwrap();
        let latest = self.manifest_cache.fetch_authoritative()?;
        if latest.lock != state.last_manifest.lock {
            state.table_set.rebase(latest.specs.clone())?;
            state.last_manifest = latest;
        }
        Ok(state.last_manifest.root)
    }

    /// Attempt to advance the store's root to `new_root`, contingent on the
    /// caller's belief that the current root is still `expected_root`.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` if another writer moved
    /// the root first (the store's view has been rebased onto their work;
    /// the caller should recompute `new_root` against the refreshed
    /// [`Self::root`] and retry), and `Err` for anything else.
    pub fn commit(&self, new_root: Address, expected_root: Address) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();

        if state.last_manifest.root != expected_root {
            debug!(
                "commit: expected root {} but store is at {}, caller must rebase",
                expected_root, state.last_manifest.root
            );
            return Ok(false);
        }

        if !state.memtable.is_empty() {
            self.flush_locked(&mut state)?;
        }

        let retired = if Conjoiner::is_required(state.table_set.count()) {
            self.conjoin_all_locked(&mut state)?
        } else {
            Vec::new()
        };

        let new_specs = state.table_set.to_specs();
        let expected_lock = state.last_manifest.lock;

        match self.manifest_cache.commit(expected_lock, new_root, new_specs) {
            Ok(updated) => {
                state.table_set.flatten();
                state.last_manifest = updated;
                // Only now is it safe to remove the tables the conjoin
                // replaced: the manifest that stopped referencing them is
                // durable, so no reader can still be depending on them.
                if !retired.is_empty() {
                    state.table_set.persister().delete_tables(&retired)?;
                }
                Ok(true)
            }
            Err(CommitError::OptimisticLockFailed) => {
                let latest = self.manifest_cache.fetch_authoritative()?;
                state.table_set.rebase(latest.specs.clone())?;
                state.last_manifest = latest;
                // Lost the race: our speculative conjoin was never
                // committed, so the old tables are still the manifest's
                // tables. Leave them in place.
                Ok(false)
            }
            Err(other) => Err(other.into()),
        }
    }

    fn flush_locked(&self, state: &mut StoreState) -> Result<(), Error> {
        if state.memtable.is_empty() {
            return Ok(());
        }
        let chunks = state.memtable.drain();
        let (spec, image) = build_table_with_spec(&chunks);
        state.table_set.persister().persist_table(spec, &image)?;
        state.table_set.prepend_novel(spec, &image)?;
        debug!("flushed memtable: {} chunks into table {}", spec.chunk_count, spec.name);

        if Conjoiner::should_conjoin(state.table_set.novel_tables().len(), self.config.max_tables) {
            self.conjoin_novel_locked(state)?;
        }
        Ok(())
    }

    fn conjoin_novel_locked(&self, state: &mut StoreState) -> Result<(), Error> {
        let selection = Conjoiner::plan(state.table_set.novel_tables());
        if selection.is_empty() {
            return Ok(());
        }
        let old_names: Vec<Address> = selection.iter().map(|(spec, _)| spec.name).collect();
        let (new_spec, image) = Conjoiner::conjoin(&selection, state.table_set.chunk_source().as_ref())?;
        state.table_set.persister().persist_table(new_spec, &image)?;
        state.table_set.splice_novel(&old_names, new_spec, &image)?;
        state.table_set.persister().delete_tables(&old_names)?;
        self.stats.lock().unwrap().record_conjoin(old_names.len() as u64);
        Ok(())
    }

    /// Compact already-durable upstream tables. Novel tables are never
    /// touched here: they have no manifest entry yet, so conjoining them
    /// together is [`Self::conjoin_novel_locked`]'s job, run at flush time.
    ///
    /// Returns the old table names the conjoin replaced. The caller must
    /// not delete them until the manifest that drops them from `specs` is
    /// durably committed - see the comments at each of
    /// [`Self::commit`]'s outcomes.
    fn conjoin_all_locked(&self, state: &mut StoreState) -> Result<Vec<Address>, Error> {
        let selection = Conjoiner::plan(state.table_set.upstream_tables());
        if selection.is_empty() {
            return Ok(Vec::new());
        }
        let old_names: Vec<Address> = selection.iter().map(|(spec, _)| spec.name).collect();
        let (new_spec, image) = Conjoiner::conjoin(&selection, state.table_set.chunk_source().as_ref())?;
        state.table_set.persister().persist_table(new_spec, &image)?;
        state.table_set.splice_upstream(&old_names, new_spec, &image)?;
        self.stats.lock().unwrap().record_conjoin(old_names.len() as u64);
        Ok(old_names)
    }
}

fn index_cache_entry_budget(config: &StoreConfig) -> usize {
    // Parsed table indices run a few KiB each; translate the configured
    // byte budget into an entry count rather than tracking exact bytes.
    const ESTIMATED_INDEX_BYTES: u64 = 4096;
    ((config.index_cache_size / ESTIMATED_INDEX_BYTES).max(1)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("nbs-store-facade-test-{}-{}", tag, std::process::id()));
        p
    }

    fn open(tag: &str) -> (NomsBlockStore, PathBuf) {
        let dir = scratch_dir(tag);
        let mut config = StoreConfig::default();
        config.mem_table_size = 64;
        let store = NomsBlockStore::open_local(dir.clone(), config).unwrap();
        (store, dir)
    }

    #[test]
    fn put_then_get_round_trips_through_the_memtable() {
        let (store, dir) = open("put-get");
        let chunk = Chunk::new(b"hello world".to_vec());
        store.put(chunk.clone()).unwrap();
        let fetched = store.get(&chunk.address()).unwrap().unwrap();
        assert_eq!(fetched.data(), chunk.data());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn commit_fails_when_expected_root_is_stale() {
        let (store, dir) = open("stale-root");
        let ok = store.commit(Address::hash(b"new root"), Address::hash(b"not the current root")).unwrap();
        assert!(!ok);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn commit_advances_root_on_match() {
        let (store, dir) = open("commit-advances");
        let current = store.root();
        let new_root = Address::hash(b"committed root");
        let ok = store.commit(new_root, current).unwrap();
        assert!(ok);
        assert_eq!(store.root(), new_root);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn dedup_put_does_not_duplicate_memtable_entries() {
        let (store, dir) = open("dedup");
        let chunk = Chunk::new(b"same content".to_vec());
        store.put(chunk.clone()).unwrap();
        store.put(chunk.clone()).unwrap();
        assert!(store.has(&chunk.address()));
        std::fs::remove_dir_all(dir).ok();
    }
}
