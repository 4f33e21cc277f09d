//! Cache of parsed table trailers.
//!
//! Parsing a table's trailer means a physical read plus walking its prefix
//! index; a [`crate::table_set::TableSet`] does this on every lookup that
//! misses the memtable, so keeping recently-used [`TableIndex`]es around is
//! the single highest-value cache in the store. Entries are `Arc`-wrapped
//! so a reader mid-lookup keeps its index alive even if it is evicted from
//! the cache a moment later.
//!
//! Concurrent misses on the same table name are coalesced: the first caller
//! runs `loader`, later callers block on a condvar and clone its result
//! rather than each issuing a redundant physical read.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Error;

use nbs_tools::lru_cache::LruCache;

use crate::hash::Address;
use crate::table::reader::TableIndex;

type LoadResult = Result<Arc<TableIndex>, String>;

struct InFlight {
    result: Mutex<Option<LoadResult>>,
    done: Condvar,
}

pub struct IndexCache {
    cache: Mutex<LruCache<Address, Arc<TableIndex>>>,
    in_flight: Mutex<HashMap<Address, Arc<InFlight>>>,
}

impl IndexCache {
    pub fn new(capacity: usize) -> Self {
        IndexCache {
            cache: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached index for `name`, or call `loader` to parse it and
    /// cache the result. Concurrent callers for the same `name` share a
    /// single `loader` invocation.
    ///
    /// Takes a closure rather than a `fetch(&mut self, K) -> V` trait
    /// because the loader needs a `&dyn ChunkSource` borrowed from the
    /// caller, which such a trait has no room for.
    pub fn get_or_load(
        &self,
        name: Address,
        loader: impl FnOnce() -> Result<TableIndex, Error>,
    ) -> Result<Arc<TableIndex>, Error> {
        if let Some(hit) = self.cache.lock().unwrap().get_mut(name) {
            return Ok(hit.clone());
        }

        let (slot, is_owner) = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(&name) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(InFlight {
                        result: Mutex::new(None),
                        done: Condvar::new(),
                    });
                    in_flight.insert(name, slot.clone());
                    (slot, true)
                }
            }
        };

        if !is_owner {
            let guard = slot.result.lock().unwrap();
            let guard = slot.done.wait_while(guard, |r| r.is_none()).unwrap();
            return guard.clone().map_err(Error::msg);
        }

        let outcome = loader().map(Arc::new).map_err(|err| err.to_string());
        if let Ok(loaded) = &outcome {
            self.cache.lock().unwrap().insert(name, loaded.clone());
        }
        *slot.result.lock().unwrap() = Some(outcome.clone());
        slot.done.notify_all();
        self.in_flight.lock().unwrap().remove(&name);

        outcome.map_err(Error::msg)
    }

    pub fn invalidate(&self, name: Address) {
        self.cache.lock().unwrap().remove(name);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn empty_table() -> (Address, Vec<u8>) {
        crate::table::writer::build_table(&[])
    }

    #[test]
    fn second_lookup_is_a_cache_hit() {
        let cache = IndexCache::new(4);
        let (name, trailer) = empty_table();
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            crate::table::reader::parse_trailer(name, &trailer)
        };
        cache.get_or_load(name, load).unwrap();
        cache.get_or_load(name, load).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_reload() {
        let cache = IndexCache::new(4);
        let (name, trailer) = empty_table();
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            crate::table::reader::parse_trailer(name, &trailer)
        };
        cache.get_or_load(name, load).unwrap();
        cache.invalidate(name);
        cache.get_or_load(name, load).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_misses_coalesce_into_one_load() {
        let cache = Arc::new(IndexCache::new(4));
        let (name, trailer) = empty_table();
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                let trailer = trailer.clone();
                thread::spawn(move || {
                    cache
                        .get_or_load(name, || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            crate::table::reader::parse_trailer(name, &trailer)
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
