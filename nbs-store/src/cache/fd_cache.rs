//! Cache of open table file descriptors for the local persister backend.
//!
//! Opening a file is a syscall a hot read path shouldn't pay on every
//! lookup; this keeps the most recently used table files' descriptors open,
//! same LRU-with-refcounting shape as [`crate::cache::index_cache::IndexCache`].
//! An entry held by an in-flight read stays valid even after eviction
//! because callers hold their own `Arc` clone.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};

use nbs_tools::lru_cache::LruCache;

use crate::hash::Address;

pub struct FdCache {
    inner: Mutex<LruCache<Address, Arc<File>>>,
}

impl FdCache {
    pub fn new(capacity: usize) -> Self {
        FdCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_open(&self, name: Address, path: &Path) -> Result<Arc<File>, Error> {
        if let Some(hit) = self.inner.lock().unwrap().get_mut(name) {
            return Ok(hit.clone());
        }
        let file = Arc::new(File::open(path).with_context(|| format!("opening table file {path:?}"))?);
        self.inner.lock().unwrap().insert(name, file.clone());
        Ok(file)
    }

    pub fn invalidate(&self, name: Address) {
        self.inner.lock().unwrap().remove(name);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reopening_the_same_table_reuses_the_descriptor() {
        let cache = FdCache::new(2);
        let mut path = std::env::temp_dir();
        path.push(format!("nbs-fd-cache-test-{}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(b"data").unwrap();

        let name = Address::hash(b"table");
        let a = cache.get_or_open(name, &path).unwrap();
        let b = cache.get_or_open(name, &path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        std::fs::remove_file(&path).ok();
    }
}
