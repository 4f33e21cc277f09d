//! The store's root of trust: `{version, lock, root, specs}`.
//!
//! Every store has exactly one manifest, a single small file whose update is
//! the store's sole compare-and-swap point: a commit is "durable" the
//! instant its new manifest line has replaced the old one. An exclusive
//! fcntl lock ([`nbs_tools::process_locker::ProcessLocker`]) guards the
//! read-modify-write against other processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Error};
use log::{debug, warn};
use proxmox_sys::fs::{replace_file, CreateOptions};

use nbs_tools::process_locker::ProcessLocker;

use crate::error::{CommitError, CorruptionError};
use crate::hash::Address;
use crate::table::TableSpec;

/// On-disk storage format version this build writes and the newest version
/// it knows how to read.
pub const STORAGE_VERSION: u32 = 1;

/// Logical "shape" of manifest contents (root + table layout), bumped when
/// the store's wire format changes independent of `STORAGE_VERSION`.
pub const NBF_VERSION: u32 = 1;

/// Number of attempts [`LocalManifestManager::update`] makes against a
/// contended exclusive lock before giving up.
const LOCK_RETRY_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// The manifest's full contents, as parsed from its single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestContents {
    pub storage_version: u32,
    pub nbf_version: u32,
    /// Changes on every successful update; used as the optimistic-lock
    /// token a CAS caller must present to prove it read the version it is
    /// about to replace.
    pub lock: Address,
    pub root: Address,
    pub specs: Vec<TableSpec>,
}

impl ManifestContents {
    pub fn empty(root: Address) -> Self {
        ManifestContents {
            storage_version: STORAGE_VERSION,
            nbf_version: NBF_VERSION,
            lock: Address::zero(),
            root,
            specs: Vec::new(),
        }
    }

    pub fn to_line(&self) -> String {
        let mut fields = vec![
            self.storage_version.to_string(),
            self.nbf_version.to_string(),
            self.lock.to_hex(),
            self.root.to_hex(),
        ];
        fields.extend(self.specs.iter().map(TableSpec::to_manifest_field));
        fields.join(":")
    }

    pub fn parse(line: &str) -> Result<Self, Error> {
        let mut parts = line.trim_end().split(':');
        let storage_version: u32 = parts
            .next()
            .ok_or_else(|| CorruptionError::MalformedManifest(line.to_string()))?
            .parse()
            .context("parsing storage version")?;
        if storage_version > STORAGE_VERSION {
            anyhow::bail!(CorruptionError::UnsupportedStorageVersion {
                found: storage_version,
                supported: STORAGE_VERSION,
            });
        }
        let nbf_version: u32 = parts
            .next()
            .ok_or_else(|| CorruptionError::MalformedManifest(line.to_string()))?
            .parse()
            .context("parsing nbf version")?;
        let lock = Address::from_hex(
            parts
                .next()
                .ok_or_else(|| CorruptionError::MalformedManifest(line.to_string()))?,
        )?;
        let root = Address::from_hex(
            parts
                .next()
                .ok_or_else(|| CorruptionError::MalformedManifest(line.to_string()))?,
        )?;

        let rest: Vec<&str> = parts.collect();
        if rest.len() % 2 != 0 {
            anyhow::bail!(CorruptionError::MalformedManifest(line.to_string()));
        }
        let mut specs = Vec::with_capacity(rest.len() / 2);
        for pair in rest.chunks_exact(2) {
            specs.push(TableSpec::from_manifest_field(&format!("{}:{}", pair[0], pair[1]))?);
        }

        Ok(ManifestContents {
            storage_version,
            nbf_version,
            lock,
            root,
            specs,
        })
    }

    fn next_lock(&self) -> Address {
        // The lock token only needs to change on every update and be hard to
        // guess; hashing the current contents plus a fresh root/specs view
        // satisfies both without requiring a random source.
        Address::hash(format!("{}:{:?}", self.to_line(), self.specs).as_bytes())
    }
}

/// Durable storage for a store's single manifest, with optimistic
/// compare-and-swap updates.
pub trait ManifestManager: Send + Sync {
    fn fetch(&self) -> Result<ManifestContents, Error>;

    /// Atomically replace the manifest, but only if its current `lock`
    /// token still equals `expected_lock` - i.e. nobody else committed
    /// since the caller last read it.
    fn update(
        &self,
        expected_lock: Address,
        new_root: Address,
        new_specs: Vec<TableSpec>,
    ) -> Result<ManifestContents, CommitError>;
}

pub struct LocalManifestManager {
    manifest_path: PathBuf,
    locker: Arc<Mutex<ProcessLocker>>,
}

impl LocalManifestManager {
    pub fn new(base_dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(base_dir)?;
        let manifest_path = base_dir.join("manifest");
        let lock_path = base_dir.join("manifest.lock");
        let locker = ProcessLocker::new(&lock_path)?;
        if !manifest_path.exists() {
            let initial = ManifestContents::empty(Address::zero());
            replace_file(&manifest_path, initial.to_line().as_bytes(), CreateOptions::new(), false)
                .context("writing initial manifest")?;
        }
        Ok(LocalManifestManager { manifest_path, locker })
    }

    fn read_raw(&self) -> Result<ManifestContents, Error> {
        let text = fs::read_to_string(&self.manifest_path)
            .with_context(|| format!("reading manifest {:?}", self.manifest_path))?;
        ManifestContents::parse(text.trim())
    }
}

impl ManifestManager for LocalManifestManager {
    fn fetch(&self) -> Result<ManifestContents, Error> {
        self.read_raw()
    }

    fn update(
        &self,
        expected_lock: Address,
        new_root: Address,
        new_specs: Vec<TableSpec>,
    ) -> Result<ManifestContents, CommitError> {
        let mut attempt = 0;
        let guard = loop {
            match ProcessLocker::try_exclusive_lock(self.locker.clone()) {
                Ok(guard) => break guard,
                Err(_) if attempt < LOCK_RETRY_ATTEMPTS => {
                    attempt += 1;
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(CommitError::PersistFailed(e)),
            }
        };

        let current = self
            .read_raw()
            .map_err(CommitError::PersistFailed)?;
        if current.lock != expected_lock {
            warn!(
                "manifest CAS failed: expected lock {}, found {}",
                expected_lock, current.lock
            );
            return Err(CommitError::OptimisticLockFailed);
        }

        let mut next = ManifestContents {
            storage_version: STORAGE_VERSION,
            nbf_version: NBF_VERSION,
            lock: Address::zero(),
            root: new_root,
            specs: new_specs,
        };
        next.lock = next.next_lock();

        replace_file(&self.manifest_path, next.to_line().as_bytes(), CreateOptions::new(), false)
            .map_err(|e| CommitError::PersistFailed(e.into()))?;

        debug!("manifest updated: root={} tables={}", next.root, next.specs.len());
        drop(guard);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name_byte: u8, count: u32) -> TableSpec {
        TableSpec {
            name: Address::hash(&[name_byte]),
            chunk_count: count,
        }
    }

    #[test]
    fn line_format_roundtrips() {
        let contents = ManifestContents {
            storage_version: 1,
            nbf_version: 1,
            lock: Address::hash(b"lock"),
            root: Address::hash(b"root"),
            specs: vec![spec(1, 10), spec(2, 20)],
        };
        let line = contents.to_line();
        let parsed = ManifestContents::parse(&line).unwrap();
        assert_eq!(contents, parsed);
    }

    #[test]
    fn rejects_future_storage_version() {
        let line = format!("{}:1:{}:{}", STORAGE_VERSION + 1, Address::zero().to_hex(), Address::zero().to_hex());
        assert!(ManifestContents::parse(&line).is_err());
    }

    #[test]
    fn rejects_odd_spec_field_count() {
        let line = format!(
            "1:1:{}:{}:{}",
            Address::zero().to_hex(),
            Address::zero().to_hex(),
            Address::hash(b"x").to_hex()
        );
        assert!(ManifestContents::parse(&line).is_err());
    }
}
