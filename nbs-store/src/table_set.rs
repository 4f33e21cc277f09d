//! Read-side view over a store's persisted table files.
//!
//! A `TableSet` is two lists of tables: `novel` (flushed by this process
//! since the last successful commit, not yet reflected in any manifest) and
//! `upstream` (whatever the last-read manifest said was durable). Lookups
//! check `novel` before `upstream` since the newest data is the most likely
//! to be asked for again. The [`crate::memtable::Memtable`] sits in front of
//! both and is not this type's concern; [`crate::store::NomsBlockStore`]
//! checks it first.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Error;
use log::debug;

use crate::cache::index_cache::IndexCache;
use crate::chunk::Chunk;
use crate::hash::Address;
use crate::persister::{ChunkSource, Persister};
use crate::table::reader::{parse_trailer, TableIndex};
use crate::table::TableSpec;

type LoadedTable = (TableSpec, Arc<TableIndex>);

pub struct TableSet {
    persister: Arc<dyn Persister>,
    chunk_source: Arc<dyn ChunkSource>,
    index_cache: Arc<IndexCache>,
    novel: Vec<LoadedTable>,
    upstream: Vec<LoadedTable>,
}

impl TableSet {
    pub fn new(
        persister: Arc<dyn Persister>,
        index_cache: Arc<IndexCache>,
        upstream_specs: Vec<TableSpec>,
    ) -> Result<Self, Error> {
        let chunk_source = persister.source();
        let mut set = TableSet {
            persister,
            chunk_source,
            index_cache,
            novel: Vec::new(),
            upstream: Vec::new(),
        };
        set.upstream = set.load_all(upstream_specs)?;
        Ok(set)
    }

    fn load_one(&self, spec: TableSpec) -> Result<LoadedTable, Error> {
        let source = self.chunk_source.clone();
        let index = self.index_cache.get_or_load(spec.name, || {
            let trailer_len = crate::table::trailer_len(spec.chunk_count);
            let trailer = source.read_tail(spec.name, trailer_len)?;
            parse_trailer(spec.name, &trailer)
        })?;
        Ok((spec, index))
    }

    fn load_all(&self, specs: Vec<TableSpec>) -> Result<Vec<LoadedTable>, Error> {
        specs.into_iter().map(|spec| self.load_one(spec)).collect()
    }

    /// Number of table files backing this set (novel + upstream).
    pub fn count(&self) -> usize {
        self.novel.len() + self.upstream.len()
    }

    /// Sum of on-disk data-region bytes across every table, a lower bound
    /// on physical storage used (duplicate chunks across un-conjoined
    /// tables count more than once).
    pub fn physical_len(&self) -> u64 {
        self.novel
            .iter()
            .chain(self.upstream.iter())
            .map(|(_, idx)| idx.total_data_len())
            .sum()
    }

    fn tables(&self) -> impl Iterator<Item = &LoadedTable> {
        self.novel.iter().chain(self.upstream.iter())
    }

    pub fn has(&self, addr: &Address) -> bool {
        self.tables().any(|(_, idx)| idx.has(addr))
    }

    /// Returns the subset of `addrs` that are absent from every table in
    /// this set, mirroring the `HasMany` convention of reporting what's
    /// missing rather than what's present (the caller usually already has
    /// the found ones from the memtable).
    pub fn has_many(&self, addrs: &[Address]) -> HashSet<Address> {
        let mut absent: HashSet<Address> = addrs.iter().copied().collect();
        for (_, idx) in self.tables() {
            absent.retain(|a| !idx.has(a));
            if absent.is_empty() {
                break;
            }
        }
        absent
    }

    pub fn get(&self, addr: &Address) -> Result<Option<Chunk>, Error> {
        for (spec, idx) in self.tables() {
            if let Some((offset, len)) = idx.lookup(addr) {
                let data = self.chunk_source.read_range(spec.name, offset, len)?;
                return Ok(Some(Chunk::with_address(*addr, data)?));
            }
        }
        Ok(None)
    }

    /// Fetch every requested address found in this set, coalescing all
    /// hits against the same table into a single [`ChunkSource::read_many`]
    /// call. Returns found chunks plus the addresses that were absent.
    pub fn get_many(&self, addrs: &[Address]) -> Result<(Vec<Chunk>, HashSet<Address>), Error> {
        let mut remaining: HashSet<Address> = addrs.iter().copied().collect();
        let mut found = Vec::new();

        for (spec, idx) in self.tables() {
            if remaining.is_empty() {
                break;
            }
            let mut hit_addrs = Vec::new();
            let mut ranges = Vec::new();
            for addr in remaining.iter() {
                if let Some(range) = idx.lookup(addr) {
                    hit_addrs.push(*addr);
                    ranges.push(range);
                }
            }
            if ranges.is_empty() {
                continue;
            }
            let payloads = self.chunk_source.read_many(spec.name, &ranges)?;
            for (addr, data) in hit_addrs.into_iter().zip(payloads) {
                remaining.remove(&addr);
                found.push(Chunk::with_address(addr, data)?);
            }
        }

        Ok((found, remaining))
    }

    /// Map each found address to the table file holding it, for
    /// `GetChunkLocations`-style diagnostics. Addresses absent from this
    /// set are omitted from the returned map and included in the returned
    /// absent set.
    pub fn locate_many(&self, addrs: &[Address]) -> (std::collections::HashMap<Address, Address>, HashSet<Address>) {
        let mut remaining: HashSet<Address> = addrs.iter().copied().collect();
        let mut locations = std::collections::HashMap::new();
        for (spec, idx) in self.tables() {
            if remaining.is_empty() {
                break;
            }
            remaining.retain(|addr| {
                if idx.has(addr) {
                    locations.insert(*addr, spec.name);
                    false
                } else {
                    true
                }
            });
        }
        (locations, remaining)
    }

    /// Estimate how many physical reads satisfying `addrs` would cost: one
    /// per distinct table holding at least one requested address, since
    /// [`Self::get_many`] coalesces per-table hits into a single read.
    pub fn calc_reads(&self, addrs: &[Address]) -> usize {
        let mut remaining: HashSet<Address> = addrs.iter().copied().collect();
        let mut reads = 0;
        for (_, idx) in self.tables() {
            if remaining.is_empty() {
                break;
            }
            let before = remaining.len();
            remaining.retain(|a| !idx.has(a));
            if remaining.len() < before {
                reads += 1;
            }
        }
        reads
    }

    /// Register a newly flushed table as the new head of `novel`.
    pub fn prepend_novel(&mut self, spec: TableSpec, image: &[u8]) -> Result<(), Error> {
        let trailer_len = crate::table::trailer_len(spec.chunk_count) as usize;
        let trailer = &image[image.len() - trailer_len..];
        let index = Arc::new(parse_trailer(spec.name, trailer)?);
        self.index_cache.invalidate(spec.name);
        debug!("table set: adding novel table {} ({} chunks)", spec.name, spec.chunk_count);
        self.novel.insert(0, (spec, index));
        Ok(())
    }

    /// Remove every novel table named in `remove`, then add `spec` as a
    /// replacement (the result of conjoining exactly those tables). Any
    /// novel table not named in `remove` is left untouched.
    pub fn splice_novel(&mut self, remove: &[Address], spec: TableSpec, image: &[u8]) -> Result<(), Error> {
        self.novel.retain(|(old_spec, _)| {
            let drop = remove.contains(&old_spec.name);
            if drop {
                self.index_cache.invalidate(old_spec.name);
            }
            !drop
        });
        self.prepend_novel(spec, image)
    }

    /// Remove every upstream table named in `remove`, then add `spec` as a
    /// replacement (used when the conjoiner compacts tables that are
    /// already durable). Tables not named in `remove` are left untouched.
    pub fn splice_upstream(&mut self, remove: &[Address], spec: TableSpec, image: &[u8]) -> Result<(), Error> {
        self.upstream.retain(|(old_spec, _)| {
            let drop = remove.contains(&old_spec.name);
            if drop {
                self.index_cache.invalidate(old_spec.name);
            }
            !drop
        });
        let trailer_len = crate::table::trailer_len(spec.chunk_count) as usize;
        let trailer = &image[image.len() - trailer_len..];
        let index = Arc::new(parse_trailer(spec.name, trailer)?);
        self.upstream.push((spec, index));
        Ok(())
    }

    /// The full table list in the precedence order a new manifest should
    /// record: novel tables (newest first) ahead of upstream.
    pub fn to_specs(&self) -> Vec<TableSpec> {
        self.novel
            .iter()
            .chain(self.upstream.iter())
            .map(|(spec, _)| *spec)
            .collect()
    }

    /// Called after a successful manifest commit: novel tables are now part
    /// of the durable upstream baseline.
    pub fn flatten(&mut self) {
        let mut merged = std::mem::take(&mut self.novel);
        merged.append(&mut self.upstream);
        self.upstream = merged;
    }

    /// Called after losing the optimistic commit race: discard our view of
    /// `upstream` and reload from the manifest that won, keeping `novel`
    /// (our uncommitted work) queued for retry on top of it.
    pub fn rebase(&mut self, new_upstream_specs: Vec<TableSpec>) -> Result<(), Error> {
        self.upstream = self.load_all(new_upstream_specs)?;
        Ok(())
    }

    pub fn novel_tables(&self) -> &[LoadedTable] {
        &self.novel
    }

    pub fn upstream_tables(&self) -> &[LoadedTable] {
        &self.upstream
    }

    pub fn persister(&self) -> &Arc<dyn Persister> {
        &self.persister
    }

    pub fn chunk_source(&self) -> &Arc<dyn ChunkSource> {
        &self.chunk_source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::local::LocalPersister;
    use crate::table::writer::build_table_with_spec;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("nbs-table-set-test-{}-{}", tag, std::process::id()));
        p
    }

    #[test]
    fn novel_tables_are_checked_before_upstream() {
        let dir = scratch_dir("novel-before-upstream");
        let persister = Arc::new(LocalPersister::new(dir.clone()).unwrap());
        let index_cache = Arc::new(IndexCache::new(8));
        let mut set = TableSet::new(persister.clone(), index_cache, vec![]).unwrap();

        let chunk = Chunk::new(b"hello".to_vec());
        let (spec, image) = build_table_with_spec(&[chunk.clone()]);
        persister.persist_table(spec, &image).unwrap();
        set.prepend_novel(spec, &image).unwrap();

        assert!(set.has(&chunk.address()));
        let fetched = set.get(&chunk.address()).unwrap().unwrap();
        assert_eq!(fetched.data(), chunk.data());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn flatten_merges_novel_into_upstream() {
        let dir = scratch_dir("flatten");
        let persister = Arc::new(LocalPersister::new(dir.clone()).unwrap());
        let index_cache = Arc::new(IndexCache::new(8));
        let mut set = TableSet::new(persister.clone(), index_cache, vec![]).unwrap();

        let (spec, image) = build_table_with_spec(&[Chunk::new(b"a".to_vec())]);
        persister.persist_table(spec, &image).unwrap();
        set.prepend_novel(spec, &image).unwrap();
        assert_eq!(set.novel_tables().len(), 1);

        set.flatten();
        assert_eq!(set.novel_tables().len(), 0);
        assert_eq!(set.upstream_tables().len(), 1);

        std::fs::remove_dir_all(dir).ok();
    }
}
