//! Table file compaction.
//!
//! As a [`crate::table_set::TableSet`] accumulates flushed tables it will
//! eventually hold more of them than is healthy for read fan-out; the
//! conjoiner merges a handful of the smallest ones into a single table:
//! merge enough to matter, but only ever the smallest tables, so the amount
//! of data rewritten stays bounded.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::chunk::Chunk;
use crate::hash::Address;
use crate::persister::ChunkSource;
use crate::table::reader::TableIndex;
use crate::table::writer::build_table_with_spec;
use crate::table::TableSpec;

/// A table set is asked to conjoin once it holds more than this many table
/// files, regardless of `StoreConfig::max_tables` (which governs when a
/// conjoin is *offered*; this is the point past which it is *required*
/// before another flush may proceed, to bound read fan-out on a pathological
/// producer that never calls `commit`).
pub const CONJOIN_REQUIRED_THRESHOLD: usize = 256;

pub struct Conjoiner;

impl Conjoiner {
    /// Whether `table_count` tables (vs. the store's configured
    /// `max_tables`) warrants offering a conjoin.
    pub fn should_conjoin(table_count: usize, max_tables: usize) -> bool {
        table_count > max_tables
    }

    pub fn is_required(table_count: usize) -> bool {
        table_count > CONJOIN_REQUIRED_THRESHOLD
    }

    /// Choose which of `tables` to merge: the smallest half by chunk count,
    /// since merging small tables recovers the most fan-out per byte
    /// rewritten. Always selects at least two tables (a conjoin of fewer is
    /// a no-op) and never more than `tables.len() - 1`, so the table set
    /// always keeps at least one unmerged table as the new novel head.
    pub fn plan(tables: &[(TableSpec, Arc<TableIndex>)]) -> Vec<(TableSpec, Arc<TableIndex>)> {
        if tables.len() < 2 {
            return Vec::new();
        }
        let mut sorted: Vec<_> = tables.to_vec();
        sorted.sort_by_key(|(spec, _)| spec.chunk_count);
        let take = (sorted.len() / 2).max(2).min(sorted.len());
        sorted.into_iter().take(take).collect()
    }

    /// Merge `selection` into a single new table, deduplicating any address
    /// that happens to appear in more than one of the source tables.
    pub fn conjoin(
        selection: &[(TableSpec, Arc<TableIndex>)],
        chunk_source: &dyn ChunkSource,
    ) -> Result<(TableSpec, Vec<u8>), anyhow::Error> {
        let mut merged: BTreeMap<Address, Vec<u8>> = BTreeMap::new();

        for (spec, index) in selection {
            let addresses = index.addresses_in_ordinal_order();
            let ranges: Vec<(u64, u32)> = addresses
                .iter()
                .map(|a| index.lookup(a).expect("address came from this index"))
                .collect();
            let payloads = chunk_source.read_many(spec.name, &ranges)?;
            for (addr, payload) in addresses.into_iter().zip(payloads) {
                merged.entry(addr).or_insert(payload);
            }
        }

        let chunks: Vec<Chunk> = merged
            .into_iter()
            .map(|(addr, data)| Chunk::with_address(addr, data))
            .collect::<Result<_, _>>()?;

        let merged_count: u32 = chunks.len() as u32;
        let (new_spec, image) = build_table_with_spec(&chunks);
        info!(
            "conjoined {} tables ({} total chunk slots, {} unique) into {}",
            selection.len(),
            selection.iter().map(|(s, _)| s.chunk_count as u64).sum::<u64>(),
            merged_count,
            new_spec.name,
        );
        Ok((new_spec, image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::reader::parse_trailer;
    use crate::table::writer::build_table;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeSource {
        tables: Mutex<HashMap<Address, Vec<u8>>>,
    }

    impl ChunkSource for FakeSource {
        fn table_len(&self, name: Address) -> Result<u64, anyhow::Error> {
            Ok(self.tables.lock().unwrap()[&name].len() as u64)
        }
        fn read_tail(&self, name: Address, len: u64) -> Result<Vec<u8>, anyhow::Error> {
            let tables = self.tables.lock().unwrap();
            let image = &tables[&name];
            Ok(image[image.len() - len as usize..].to_vec())
        }
        fn read_range(&self, name: Address, offset: u64, len: u32) -> Result<Vec<u8>, anyhow::Error> {
            let tables = self.tables.lock().unwrap();
            let image = &tables[&name];
            Ok(image[offset as usize..offset as usize + len as usize].to_vec())
        }
    }

    fn make_table(data: &[&[u8]]) -> (TableSpec, Arc<TableIndex>, Vec<u8>) {
        let chunks: Vec<Chunk> = data.iter().map(|d| Chunk::new(d.to_vec())).collect();
        let (spec, image) = build_table_with_spec(&chunks);
        let trailer_len = crate::table::trailer_len(spec.chunk_count) as usize;
        let trailer = &image[image.len() - trailer_len..];
        let index = Arc::new(parse_trailer(spec.name, trailer).unwrap());
        (spec, index, image)
    }

    #[test]
    fn merges_and_dedupes_across_tables() {
        let (spec_a, index_a, image_a) = make_table(&[b"one", b"two"]);
        let (spec_b, index_b, image_b) = make_table(&[b"two", b"three"]);

        let mut tables = HashMap::new();
        tables.insert(spec_a.name, image_a);
        tables.insert(spec_b.name, image_b);
        let source = FakeSource {
            tables: Mutex::new(tables),
        };

        let (merged_spec, _image) =
            Conjoiner::conjoin(&[(spec_a, index_a), (spec_b, index_b)], &source).unwrap();
        assert_eq!(merged_spec.chunk_count, 3);
    }

    #[test]
    fn plan_skips_single_table() {
        let (spec, index, _image) = make_table(&[b"solo"]);
        assert!(Conjoiner::plan(&[(spec, index)]).is_empty());
    }
}
