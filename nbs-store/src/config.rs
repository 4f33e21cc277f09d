//! Store configuration.
//!
//! A plain `serde` struct with `#[serde(default = "...")]` on every field
//! so that old config files missing newer keys still deserialize.

use serde::{Deserialize, Serialize};

fn default_mem_table_size() -> u64 {
    // 128 MiB.
    128 * 1024 * 1024
}

fn default_max_tables() -> usize {
    256
}

fn default_index_cache_size() -> u64 {
    64 * 1024 * 1024
}

fn default_manifest_cache_size() -> usize {
    1
}

fn default_preflush_chunk_count() -> usize {
    8
}

fn default_fd_cache_size() -> usize {
    64
}

/// Tunables for a single [`crate::store::NomsBlockStore`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Byte budget for the in-memory memtable before it must flush.
    #[serde(default = "default_mem_table_size")]
    pub mem_table_size: u64,

    /// Maximum number of table files a [`crate::table_set::TableSet`] keeps
    /// before the conjoiner is asked to merge some of them.
    #[serde(default = "default_max_tables")]
    pub max_tables: usize,

    /// Byte budget for the process-wide parsed-index cache.
    #[serde(default = "default_index_cache_size")]
    pub index_cache_size: u64,

    /// Number of prior manifest contents kept in the manifest cache.
    #[serde(default = "default_manifest_cache_size")]
    pub manifest_cache_size: usize,

    /// Number of chunks allowed to accumulate in the memtable beyond its
    /// byte budget before a flush is forced, used to bound worst-case
    /// per-chunk overhead when chunks are tiny.
    #[serde(default = "default_preflush_chunk_count")]
    pub preflush_chunk_count: usize,

    /// Maximum number of concurrently open table file descriptors.
    #[serde(default = "default_fd_cache_size")]
    pub fd_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            mem_table_size: default_mem_table_size(),
            max_tables: default_max_tables(),
            index_cache_size: default_index_cache_size(),
            manifest_cache_size: default_manifest_cache_size(),
            preflush_chunk_count: default_preflush_chunk_count(),
            fd_cache_size: default_fd_cache_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let parsed: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.mem_table_size, default_mem_table_size());
        assert_eq!(parsed.max_tables, default_max_tables());
    }

    #[test]
    fn explicit_keys_override_defaults() {
        let parsed: StoreConfig =
            serde_json::from_str(r#"{"mem_table_size": 4096, "max_tables": 4}"#).unwrap();
        assert_eq!(parsed.mem_table_size, 4096);
        assert_eq!(parsed.max_tables, 4);
        assert_eq!(parsed.index_cache_size, default_index_cache_size());
    }
}
