//! Error taxonomy.
//!
//! Closed, programmatically-matched failures live in [`CommitError`], a
//! `thiserror` enum for anything a caller needs to branch on. Everything
//! else - I/O, malformed on-disk data, config parsing - is surfaced as
//! `anyhow::Error`.

use thiserror::Error;

use crate::hash::Address;

/// Failure modes of [`crate::store::NomsBlockStore::commit`] that a caller is
/// expected to branch on (retry vs. give up).
#[derive(Debug, Error)]
pub enum CommitError {
    /// The manifest's root no longer matches `last_root`; the caller raced
    /// another committer and should rebase and retry.
    #[error("root mismatch: expected {expected}, manifest has {actual}")]
    RootMismatch { expected: Address, actual: Address },

    /// The manifest's lock hash changed between read and write: someone
    /// else is mid-commit. Caller should back off and retry.
    #[error("optimistic lock failed: manifest was updated concurrently")]
    OptimisticLockFailed,

    /// The commit was cancelled by its caller before the CAS update landed.
    #[error("commit cancelled")]
    Cancelled,

    /// Persisting the novel table file(s) failed.
    #[error("failed to persist table file: {0}")]
    PersistFailed(#[source] anyhow::Error),
}

/// Corruption detected while reading a table file or manifest.
#[derive(Debug, Error)]
pub enum CorruptionError {
    #[error("bad magic in table footer: expected {expected:x?}, got {actual:x?}")]
    BadTableMagic { expected: [u8; 8], actual: [u8; 8] },

    #[error("table file {0} is truncated: trailer does not fit in file")]
    TruncatedTable(String),

    #[error("chunk {0} failed verification: address does not match content hash")]
    ChunkHashMismatch(Address),

    #[error("manifest line is malformed: {0}")]
    MalformedManifest(String),

    #[error("manifest storage version {found} is newer than supported version {supported}")]
    UnsupportedStorageVersion { found: u32, supported: u32 },
}
