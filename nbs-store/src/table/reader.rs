//! Parsing and lookup over a table file's trailer.

use crate::error::CorruptionError;
use crate::hash::Address;

use super::{TableFooter, TableSpec, FOOTER_LEN, INDEX_ENTRY_LEN, LENGTH_ENTRY_LEN, SUFFIX_ENTRY_LEN, TABLE_MAGIC};

/// A parsed table index: enough to answer `has`/`get` without touching the
/// data region until a hit requires it.
///
/// Holds owned copies of the trailer's component arrays rather than a raw
/// mmap pointer into them: this store's index cache already keeps parsed
/// `TableIndex` values resident (see [`crate::cache::index_cache`]), so a
/// live mmap would only tie the index's lifetime to the table's open file
/// descriptor for no benefit.
#[derive(Debug, Clone)]
pub struct TableIndex {
    name: Address,
    prefixes: Vec<u64>,
    ordinals: Vec<u32>,
    lengths: Vec<u32>,
    suffixes: Vec<[u8; SUFFIX_ENTRY_LEN]>,
    /// Byte offset into the data region of each ordinal's payload.
    offsets: Vec<u64>,
    total_data_len: u64,
}

impl TableIndex {
    pub fn name(&self) -> Address {
        self.name
    }

    pub fn chunk_count(&self) -> usize {
        self.prefixes.len()
    }

    pub fn total_data_len(&self) -> u64 {
        self.total_data_len
    }

    pub fn spec(&self) -> TableSpec {
        TableSpec {
            name: self.name,
            chunk_count: self.prefixes.len() as u32,
        }
    }

    /// Look up `addr`, returning the `(offset, length)` of its payload in
    /// the data region if present.
    pub fn lookup(&self, addr: &Address) -> Option<(u64, u32)> {
        let prefix = addr.prefix();
        let suffix = addr.suffix();
        let start = self.prefixes.partition_point(|&p| p < prefix);
        for i in start..self.prefixes.len() {
            if self.prefixes[i] != prefix {
                break;
            }
            let ordinal = self.ordinals[i] as usize;
            if self.suffixes[ordinal] == suffix {
                return Some((self.offsets[ordinal], self.lengths[ordinal]));
            }
        }
        None
    }

    pub fn has(&self, addr: &Address) -> bool {
        self.lookup(addr).is_some()
    }

    /// Every address this table holds, in the order its entries were
    /// physically written (ordinal order) - the order a conjoin pass wants.
    pub fn addresses_in_ordinal_order(&self) -> Vec<Address> {
        let mut by_ordinal: Vec<(u32, Address)> = self
            .prefixes
            .iter()
            .zip(self.ordinals.iter())
            .zip(self.suffixes.iter())
            .map(|((&prefix, &ordinal), suffix)| (ordinal, Address::from_prefix_and_suffix(prefix, suffix)))
            .collect();
        by_ordinal.sort_by_key(|(ordinal, _)| *ordinal);
        by_ordinal.into_iter().map(|(_, addr)| addr).collect()
    }
}

/// Parse a table file's trailer out of `table_name` (the content-addressed
/// name expected to match the trailer's own hash) and the raw trailer bytes
/// (everything from the end of the data region to EOF).
pub fn parse_trailer(table_name: Address, trailer: &[u8]) -> Result<TableIndex, anyhow::Error> {
    if trailer.len() < FOOTER_LEN {
        anyhow::bail!(CorruptionError::TruncatedTable(table_name.to_hex()));
    }
    let footer_bytes: [u8; FOOTER_LEN] = trailer[trailer.len() - FOOTER_LEN..].try_into().unwrap();
    let footer = TableFooter::from_bytes(&footer_bytes);
    if footer.magic != TABLE_MAGIC {
        anyhow::bail!(CorruptionError::BadTableMagic {
            expected: TABLE_MAGIC,
            actual: footer.magic,
        });
    }

    let n = footer.chunk_count as usize;
    let expected_len = n * INDEX_ENTRY_LEN + n * LENGTH_ENTRY_LEN + n * SUFFIX_ENTRY_LEN + FOOTER_LEN;
    if trailer.len() != expected_len {
        anyhow::bail!(CorruptionError::TruncatedTable(table_name.to_hex()));
    }

    let computed_name = Address::hash(trailer);
    if computed_name != table_name {
        anyhow::bail!(
            "table {} failed integrity check: trailer hashes to {}",
            table_name,
            computed_name
        );
    }

    let index_region = &trailer[..n * INDEX_ENTRY_LEN];
    let lengths_region = &trailer[n * INDEX_ENTRY_LEN..n * INDEX_ENTRY_LEN + n * LENGTH_ENTRY_LEN];
    let suffixes_region = &trailer[n * INDEX_ENTRY_LEN + n * LENGTH_ENTRY_LEN
        ..n * INDEX_ENTRY_LEN + n * LENGTH_ENTRY_LEN + n * SUFFIX_ENTRY_LEN];

    let mut prefixes = Vec::with_capacity(n);
    let mut ordinals = Vec::with_capacity(n);
    for entry in index_region.chunks_exact(INDEX_ENTRY_LEN) {
        prefixes.push(u64::from_be_bytes(entry[..8].try_into().unwrap()));
        ordinals.push(u32::from_be_bytes(entry[8..].try_into().unwrap()));
    }

    let mut lengths = Vec::with_capacity(n);
    for entry in lengths_region.chunks_exact(LENGTH_ENTRY_LEN) {
        lengths.push(u32::from_be_bytes(entry.try_into().unwrap()));
    }

    let mut suffixes = Vec::with_capacity(n);
    for entry in suffixes_region.chunks_exact(SUFFIX_ENTRY_LEN) {
        suffixes.push(entry.try_into().unwrap());
    }

    let mut offsets = Vec::with_capacity(n);
    let mut running = 0u64;
    for &len in &lengths {
        offsets.push(running);
        running += len as u64;
    }
    if running != footer.total_data_len {
        anyhow::bail!(CorruptionError::TruncatedTable(table_name.to_hex()));
    }

    Ok(TableIndex {
        name: table_name,
        prefixes,
        ordinals,
        lengths,
        suffixes,
        offsets,
        total_data_len: footer.total_data_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::table::writer::build_table;

    #[test]
    fn roundtrips_through_build_and_parse() {
        let chunks = vec![
            Chunk::new(b"alpha".to_vec()),
            Chunk::new(b"beta".to_vec()),
            Chunk::new(b"gamma".to_vec()),
        ];
        let (name, image) = build_table(&chunks);
        let data_len = image.len() - super::super::trailer_len(chunks.len() as u32) as usize;
        let trailer = &image[data_len..];
        let index = parse_trailer(name, trailer).unwrap();
        assert_eq!(index.chunk_count(), 3);
        for chunk in &chunks {
            let (offset, len) = index.lookup(&chunk.address()).expect("chunk present");
            let payload = &image[offset as usize..offset as usize + len as usize];
            assert_eq!(payload, chunk.data());
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let chunks = vec![Chunk::new(b"x".to_vec())];
        let (name, mut image) = build_table(&chunks);
        let len = image.len();
        image[len - 1] ^= 0xff;
        let data_len = len - super::super::trailer_len(1) as usize;
        let trailer = &image[data_len..];
        assert!(parse_trailer(name, trailer).is_err());
    }

    #[test]
    fn missing_address_returns_none() {
        let chunks = vec![Chunk::new(b"present".to_vec())];
        let (name, image) = build_table(&chunks);
        let data_len = image.len() - super::super::trailer_len(1) as usize;
        let trailer = &image[data_len..];
        let index = parse_trailer(name, trailer).unwrap();
        assert!(!index.has(&Address::hash(b"absent")));
    }
}
