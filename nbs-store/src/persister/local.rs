//! Local filesystem table storage.
//!
//! Two-level hex-prefix directory fanout keeps any one directory from
//! holding too many entries. Writes are atomic via temp-then-rename through
//! `proxmox_sys::fs::replace_file`; reads go through raw-fd positioned
//! reads rather than buffered `std::io`.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Error};
use log::debug;
use nix::sys::stat::fstat;
use nix::sys::uio::pread;
use proxmox_sys::fs::{replace_file, CreateOptions};

use crate::hash::Address;
use crate::table::TableSpec;

use super::{ChunkSource, Persister};

/// Two hex characters of fanout, as a `%02x` directory name.
fn table_path(base_dir: &Path, name: Address) -> PathBuf {
    let hex = name.to_hex();
    base_dir.join(&hex[0..2]).join(hex)
}

pub struct LocalPersister {
    base_dir: PathBuf,
}

impl LocalPersister {
    pub fn new(base_dir: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("creating table store directory {base_dir:?}"))?;
        for i in 0..256u16 {
            let sub = base_dir.join(format!("{:02x}", i));
            fs::create_dir_all(&sub).with_context(|| format!("creating fanout directory {sub:?}"))?;
        }
        Ok(LocalPersister { base_dir })
    }
}

impl Persister for LocalPersister {
    fn persist_table(&self, spec: TableSpec, image: &[u8]) -> Result<(), Error> {
        let path = table_path(&self.base_dir, spec.name);
        debug!("persisting table {} ({} bytes) to {:?}", spec.name, image.len(), path);
        replace_file(&path, image, CreateOptions::new(), false)
            .with_context(|| format!("writing table file {path:?}"))?;
        Ok(())
    }

    fn delete_tables(&self, names: &[Address]) -> Result<(), Error> {
        for &name in names {
            let path = table_path(&self.base_dir, name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing table file {path:?}")),
            }
        }
        Ok(())
    }

    fn table_exists(&self, name: Address) -> Result<bool, Error> {
        Ok(table_path(&self.base_dir, name).exists())
    }

    fn source(&self) -> Arc<dyn ChunkSource> {
        Arc::new(LocalChunkSource {
            base_dir: self.base_dir.clone(),
        })
    }
}

pub struct LocalChunkSource {
    base_dir: PathBuf,
}

impl LocalChunkSource {
    fn open(&self, name: Address) -> Result<fs::File, Error> {
        let path = table_path(&self.base_dir, name);
        fs::File::open(&path).with_context(|| format!("opening table file {path:?}"))
    }
}

impl ChunkSource for LocalChunkSource {
    fn table_len(&self, name: Address) -> Result<u64, Error> {
        let file = self.open(name)?;
        let st = fstat(file.as_raw_fd())?;
        Ok(st.st_size as u64)
    }

    fn read_tail(&self, name: Address, len: u64) -> Result<Vec<u8>, Error> {
        let file = self.open(name)?;
        let st = fstat(file.as_raw_fd())?;
        let size = st.st_size as u64;
        if len > size {
            anyhow::bail!("table {} is only {} bytes, cannot read {} byte tail", name, size, len);
        }
        self.read_range(name, size - len, len as u32)
    }

    fn read_range(&self, name: Address, offset: u64, len: u32) -> Result<Vec<u8>, Error> {
        let file = self.open(name)?;
        let fd = file.as_raw_fd();
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = pread(fd, &mut buf[filled..], offset as i64 + filled as i64)
                .with_context(|| format!("pread on table {}", name))?;
            if n == 0 {
                anyhow::bail!("table {} ended early at offset {}", name, offset + filled as u64);
            }
            filled += n;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::writer::build_table_with_spec;
    use crate::chunk::Chunk;

    #[test]
    fn round_trips_a_table_through_disk() {
        let dir = tempdir();
        let persister = LocalPersister::new(dir.clone()).unwrap();
        let chunks = vec![Chunk::new(b"one".to_vec()), Chunk::new(b"two".to_vec())];
        let (spec, image) = build_table_with_spec(&chunks);
        persister.persist_table(spec, &image).unwrap();
        assert!(persister.table_exists(spec.name).unwrap());

        let source = persister.source();
        assert_eq!(source.table_len(spec.name).unwrap(), image.len() as u64);
        let tail = source.read_tail(spec.name, 8).unwrap();
        assert_eq!(tail, &image[image.len() - 8..]);

        fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("nbs-store-test-{}", std::process::id()));
        p
    }
}
