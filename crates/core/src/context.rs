//! Shared store context: backends, config and clean caches.

use crate::config::Config;
use crate::generator::Generator;
use layerdb_storage::{AppendLog, KvStore};
use layerdb_types::Bytes;
use quick_cache::{sync::Cache, Weighter};
use std::sync::Arc;

/// Weighs cache entries by their full key + payload footprint.
#[derive(Clone)]
pub(crate) struct BlobWeighter;

impl Weighter<Vec<u8>, Bytes> for BlobWeighter {
    fn weight(&self, key: &Vec<u8>, val: &Bytes) -> u64 {
        (key.len() + val.len()) as u64 + 1
    }
}

/// Lock-free concurrent cache of clean (already persisted) records, keyed by
/// their full storage key.
pub(crate) type CleanCache = Cache<Vec<u8>, Bytes, BlobWeighter>;

fn new_cache(capacity_bytes: u64) -> Option<CleanCache> {
    if capacity_bytes == 0 {
        return None;
    }
    // Assume ~256 bytes per entry when sizing the index.
    let estimated_items = (capacity_bytes / 256).max(16) as usize;
    Some(Cache::with_weighter(
        estimated_items,
        capacity_bytes,
        BlobWeighter,
    ))
}

/// Everything a disk layer generation shares with its successors: the
/// backends, the configuration, and the clean caches that survive commits.
pub(crate) struct StoreContext {
    pub kv: Arc<dyn KvStore>,
    pub freezer: Arc<dyn AppendLog>,
    pub config: Config,
    pub clean_nodes: Option<CleanCache>,
    pub clean_states: Option<CleanCache>,
    /// Handle shared with the external snapshot generator task, if one runs.
    pub generator: Option<Arc<Generator>>,
}

impl StoreContext {
    pub fn new(kv: Arc<dyn KvStore>, freezer: Arc<dyn AppendLog>, config: Config) -> Self {
        Self::with_generator(kv, freezer, config, None)
    }

    pub fn with_generator(
        kv: Arc<dyn KvStore>,
        freezer: Arc<dyn AppendLog>,
        config: Config,
        generator: Option<Arc<Generator>>,
    ) -> Self {
        let clean_nodes = new_cache(config.clean_node_cache_size);
        let clean_states = new_cache(config.clean_state_cache_size);
        Self {
            kv,
            freezer,
            config,
            clean_nodes,
            clean_states,
            generator,
        }
    }

    /// Insert into the clean node cache, if enabled.
    pub fn cache_node(&self, key: &[u8], blob: Bytes) {
        if let Some(cache) = &self.clean_nodes {
            cache.insert(key.to_vec(), blob);
        }
    }

    /// Drop a key from the clean node cache, if enabled.
    pub fn evict_node(&self, key: &[u8]) {
        if let Some(cache) = &self.clean_nodes {
            cache.remove(key);
        }
    }

    /// Insert into the clean state cache, if enabled.
    pub fn cache_state(&self, key: &[u8], blob: Bytes) {
        if let Some(cache) = &self.clean_states {
            cache.insert(key.to_vec(), blob);
        }
    }

    /// Drop a key from the clean state cache, if enabled.
    pub fn evict_state(&self, key: &[u8]) {
        if let Some(cache) = &self.clean_states {
            cache.remove(key);
        }
    }
}
