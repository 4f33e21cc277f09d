//! Table file construction.

use log::debug;

use crate::chunk::Chunk;
use crate::hash::Address;

use super::{TableFooter, TableSpec, INDEX_ENTRY_LEN, LENGTH_ENTRY_LEN, SUFFIX_ENTRY_LEN, TABLE_MAGIC};

/// Serialize `chunks` (which must already be in address order, as produced
/// by [`crate::memtable::Memtable::drain`] or the conjoiner) into a table
/// file image.
///
/// Returns the table's content-derived name along with the bytes to
/// persist. The name is the hash of the table's index region, not of the
/// data: two tables holding the same chunks in the same order are
/// byte-identical and therefore share a name, which is what lets conjoin
/// results be addressed the same way ordinary flushes are.
pub fn build_table(chunks: &[Chunk]) -> (Address, Vec<u8>) {
    let n = chunks.len();
    let mut data = Vec::new();
    let mut lengths = Vec::with_capacity(n);
    let mut prefixes = Vec::with_capacity(n);
    let mut suffixes = Vec::with_capacity(n);

    for chunk in chunks {
        data.extend_from_slice(chunk.data());
        lengths.push(chunk.len() as u32);
        prefixes.push(chunk.address().prefix());
        suffixes.push(chunk.address().suffix());
    }

    let mut index = Vec::with_capacity(n * INDEX_ENTRY_LEN);
    for (ordinal, prefix) in prefixes.iter().enumerate() {
        index.extend_from_slice(&prefix.to_be_bytes());
        index.extend_from_slice(&(ordinal as u32).to_be_bytes());
    }

    let mut lengths_bytes = Vec::with_capacity(n * LENGTH_ENTRY_LEN);
    for len in &lengths {
        lengths_bytes.extend_from_slice(&len.to_be_bytes());
    }

    let mut suffixes_bytes = Vec::with_capacity(n * SUFFIX_ENTRY_LEN);
    for suffix in &suffixes {
        suffixes_bytes.extend_from_slice(suffix);
    }

    let total_len: u64 = lengths.iter().map(|&l| l as u64).sum();
    let footer = TableFooter {
        chunk_count: n as u32,
        total_data_len: total_len,
        magic: TABLE_MAGIC,
    }
    .to_bytes();

    let mut trailer = Vec::with_capacity(index.len() + lengths_bytes.len() + suffixes_bytes.len() + footer.len());
    trailer.extend_from_slice(&index);
    trailer.extend_from_slice(&lengths_bytes);
    trailer.extend_from_slice(&suffixes_bytes);
    trailer.extend_from_slice(&footer);

    let name = Address::hash(&trailer);

    debug!(
        "built table {} from {} chunks, {} data bytes, {} trailer bytes",
        name,
        n,
        data.len(),
        trailer.len()
    );

    let mut image = data;
    image.extend_from_slice(&trailer);
    (name, image)
}

/// Build a table and return its [`TableSpec`] alongside the image bytes.
pub fn build_table_with_spec(chunks: &[Chunk]) -> (TableSpec, Vec<u8>) {
    let (name, image) = build_table(chunks);
    (
        TableSpec {
            name,
            chunk_count: chunks.len() as u32,
        },
        image,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[u8]) -> Chunk {
        Chunk::new(data.to_vec())
    }

    #[test]
    fn identical_chunk_sets_produce_identical_tables() {
        let a = vec![chunk(b"one"), chunk(b"two")];
        let b = vec![chunk(b"one"), chunk(b"two")];
        let (name_a, image_a) = build_table(&a);
        let (name_b, image_b) = build_table(&b);
        assert_eq!(name_a, name_b);
        assert_eq!(image_a, image_b);
    }

    #[test]
    fn empty_table_has_zero_count_footer() {
        let (_, image) = build_table(&[]);
        assert_eq!(image.len(), super::super::FOOTER_LEN);
    }
}
