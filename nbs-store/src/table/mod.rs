//! On-disk table file format.
//!
//! A table file is an immutable, content-addressed batch of chunks written
//! once by a [`crate::memtable::Memtable`] flush or by the
//! [`crate::conjoin::Conjoiner`]. Layout, back to front:
//!
//! ```text
//! [ data region: chunk payloads, address order  ]
//! [ prefix index: N * (u64 prefix, u32 ordinal)  ]
//! [ lengths: N * u32, ordinal order              ]
//! [ suffixes: N * 12 bytes, ordinal order        ]
//! [ footer: u32 count, u64 total_len, 8B magic   ]
//! ```
//!
//! The footer is fixed-size (20 bytes) and always the last thing in the
//! file, so a reader can always find it with a single read from the end
//! regardless of table size.

pub mod reader;
pub mod writer;

use endian_trait::Endian;

use crate::hash::Address;

/// Fixed footer magic. This store has exactly one on-disk table format, so
/// a literal magic is clearer than deriving one per format.
pub const TABLE_MAGIC: [u8; 8] = *b"NBStbl1\0";

/// Byte size of the fixed-size footer trailing every table file.
pub const FOOTER_LEN: usize = 4 + 8 + 8;

/// Fixed-size trailer footer, stored little-endian on disk via
/// `endian_trait::Endian`.
#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
pub struct TableFooter {
    pub chunk_count: u32,
    pub total_data_len: u64,
    pub magic: [u8; 8],
}

impl TableFooter {
    pub fn to_bytes(self) -> [u8; FOOTER_LEN] {
        let le = self.to_le();
        let mut buf = [0u8; FOOTER_LEN];
        unsafe {
            let ptr = &le as *const TableFooter as *const u8;
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), FOOTER_LEN);
        }
        buf
    }

    pub fn from_bytes(buf: &[u8; FOOTER_LEN]) -> Self {
        let mut le = TableFooter {
            chunk_count: 0,
            total_data_len: 0,
            magic: [0u8; 8],
        };
        unsafe {
            let ptr = &mut le as *mut TableFooter as *mut u8;
            std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, FOOTER_LEN);
        }
        le.from_le()
    }
}

/// Byte size of one prefix-index tuple (8-byte prefix + 4-byte ordinal).
pub const INDEX_ENTRY_LEN: usize = 8 + 4;

/// Byte size of one length entry.
pub const LENGTH_ENTRY_LEN: usize = 4;

/// Byte size of one address suffix (20-byte address minus the 8-byte prefix).
pub const SUFFIX_ENTRY_LEN: usize = 20 - 8;

/// Identity and accounting for a single table file, as referenced by a
/// manifest's `specs` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: Address,
    pub chunk_count: u32,
}

impl TableSpec {
    /// `<hex name>:<count>`, the wire form used in manifest lines (§6).
    pub fn to_manifest_field(&self) -> String {
        format!("{}:{}", self.name.to_hex(), self.chunk_count)
    }

    pub fn from_manifest_field(field: &str) -> Result<Self, anyhow::Error> {
        let (name, count) = field
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed table spec field: {field:?}"))?;
        Ok(TableSpec {
            name: Address::from_hex(name)?,
            chunk_count: count.parse()?,
        })
    }
}

/// Byte length of the trailer (index + lengths + suffixes + footer) for a
/// table holding `chunk_count` chunks.
pub fn trailer_len(chunk_count: u32) -> u64 {
    let n = chunk_count as u64;
    n * INDEX_ENTRY_LEN as u64 + n * LENGTH_ENTRY_LEN as u64 + n * SUFFIX_ENTRY_LEN as u64
        + FOOTER_LEN as u64
}
