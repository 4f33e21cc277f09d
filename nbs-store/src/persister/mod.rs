//! Table file storage backends.
//!
//! A [`Persister`] durably stores and retrieves table file images; a
//! [`ChunkSource`] is the read side split out on its own because it is what
//! [`crate::table_set::TableSet`] and the index/FD caches actually hold
//! onto day to day. Two implementations ship: [`local`] (pread against a
//! local directory) and [`remote`] (HTTP range reads against an S3/GCS-style
//! object store).

pub mod local;
pub mod remote;

use std::sync::Arc;

use anyhow::Error;

use crate::hash::Address;
use crate::table::TableSpec;

/// Durable storage for whole table file images.
pub trait Persister: Send + Sync {
    /// Write `image` as the table file named by `spec.name`. Must be atomic:
    /// a concurrent reader either sees the whole file or none of it.
    fn persist_table(&self, spec: TableSpec, image: &[u8]) -> Result<(), Error>;

    /// Remove table files no longer referenced by any manifest, called
    /// after a successful conjoin or GC pass.
    fn delete_tables(&self, names: &[Address]) -> Result<(), Error>;

    fn table_exists(&self, name: Address) -> Result<bool, Error>;

    /// A handle to the read side of this same storage.
    fn source(&self) -> Arc<dyn ChunkSource>;
}

/// Read access to persisted table files.
///
/// Implementations are expected to be cheap to clone/share (an `Arc` around
/// a connection pool or an open directory fd) since every table in a
/// [`crate::table_set::TableSet`] holds one.
pub trait ChunkSource: Send + Sync {
    /// Total byte length of the named table file.
    fn table_len(&self, name: Address) -> Result<u64, Error>;

    /// Fetch the trailing `len` bytes of the named table file - used to
    /// pull the footer/index/lengths/suffixes region without reading the
    /// (possibly large) data region ahead of it.
    fn read_tail(&self, name: Address, len: u64) -> Result<Vec<u8>, Error>;

    /// Fetch one byte range from the table's data region.
    fn read_range(&self, name: Address, offset: u64, len: u32) -> Result<Vec<u8>, Error>;

    /// Fetch several byte ranges from the same table. The default
    /// implementation issues one physical read per range; backends that can
    /// coalesce adjacent ranges into a single request (e.g. the local
    /// backend, via a single mmap) should override this.
    fn read_many(&self, name: Address, ranges: &[(u64, u32)]) -> Result<Vec<Vec<u8>>, Error> {
        ranges
            .iter()
            .map(|&(offset, len)| self.read_range(name, offset, len))
            .collect()
    }
}
