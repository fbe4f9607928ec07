//! The persistent bottom layer.
//!
//! Exactly one disk layer is live per tree. It serves the same read surface
//! as a diff layer, backed by three tiers: the aggregation buffer (dirty,
//! newest), the clean caches (hot, already persisted) and the key-value
//! store. Committing a diff layer produces a *new* disk layer that inherits
//! the buffer and caches; the old one is marked stale and refuses further
//! reads.

use crate::buffer::Buffer;
use crate::context::StoreContext;
use crate::error::{Error, Result};
use crate::history::{self, HistoryEntry};
use crate::layer::{NodeInfo, NodeSource};
use crate::solver::ReverseSolver;
use crate::DiffLayer;
use layerdb_metrics as metrics;
use layerdb_storage::{keys, schema, KvRead, KvStore, WriteBatch};
use layerdb_types::{Bytes, Hash};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The bottom-most layer, backed by the key-value store.
pub struct DiskLayer {
    root: Hash,
    id: u64,
    ctx: Arc<StoreContext>,
    /// Shared forward across disk-layer generations by `commit`.
    buffer: Arc<RwLock<Buffer>>,
    /// Guards the transition to stale; reads hold it shared.
    stale: RwLock<bool>,
}

impl DiskLayer {
    /// Build a disk layer over an existing buffer.
    pub(crate) fn new(
        root: Hash,
        id: u64,
        ctx: Arc<StoreContext>,
        buffer: Arc<RwLock<Buffer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            id,
            ctx,
            buffer,
            stale: RwLock::new(false),
        })
    }

    /// The state root this layer represents (buffer included).
    pub fn root(&self) -> Hash {
        self.root
    }

    /// The monotone state id of this layer (buffer included).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    pub(crate) fn buffer(&self) -> &Arc<RwLock<Buffer>> {
        &self.buffer
    }

    /// Whether this layer was replaced by a commit or revert.
    pub fn is_stale(&self) -> bool {
        *self.stale.read().unwrap()
    }

    fn mark_stale(&self) -> Result<()> {
        let mut stale = self.stale.write().unwrap();
        if *stale {
            return Err(Error::Stale);
        }
        *stale = true;
        Ok(())
    }

    /// Read a trie node: buffer, then clean cache, then store.
    pub(crate) fn read_node(&self, owner: &Hash, path: &[u8]) -> Result<NodeInfo> {
        let stale = self.stale.read().unwrap();
        if *stale {
            return Err(Error::Stale);
        }
        {
            let buffer = self.buffer.read().unwrap();
            if let Some(node) = buffer.node(owner, path) {
                metrics::record_dirty_hit();
                return Ok(NodeInfo {
                    blob: node.blob.clone(),
                    hash: node.hash,
                    source: NodeSource::DirtyBuffer,
                });
            }
        }
        let key = keys::trie_node_key(owner, path);
        if let Some(cache) = &self.ctx.clean_nodes {
            if let Some(blob) = cache.get(key.as_slice()) {
                metrics::record_clean_node_hit();
                let hash = Hash::keccak(&blob);
                return Ok(NodeInfo {
                    blob,
                    hash,
                    source: NodeSource::CleanCache,
                });
            }
            metrics::record_clean_node_miss();
        }
        let start = Instant::now();
        let raw = self.ctx.kv.get(&key)?;
        metrics::record_disk_read(start.elapsed().as_secs_f64());
        match raw {
            Some(raw) => {
                let blob = Bytes::from(raw);
                self.ctx.cache_node(&key, blob.clone());
                let hash = Hash::keccak(&blob);
                Ok(NodeInfo {
                    blob,
                    hash,
                    source: NodeSource::Disk,
                })
            }
            None => Ok(NodeInfo::missing()),
        }
    }

    /// Read a flat account payload: buffer, then clean cache, then store.
    pub(crate) fn read_account(&self, addr_hash: &Hash) -> Result<Bytes> {
        let stale = self.stale.read().unwrap();
        if *stale {
            return Err(Error::Stale);
        }
        if let Some(generator) = &self.ctx.generator {
            if !generator.covers(addr_hash.as_bytes()) {
                return Err(Error::NotCoveredYet);
            }
        }
        {
            let buffer = self.buffer.read().unwrap();
            if let Some(blob) = buffer.account(addr_hash) {
                metrics::record_dirty_hit();
                return Ok(blob);
            }
        }
        let key = keys::account_state_key(addr_hash);
        self.read_flat_state(&key)
    }

    /// Read a flat storage payload: buffer, then clean cache, then store.
    pub(crate) fn read_storage(&self, addr_hash: &Hash, slot_hash: &Hash) -> Result<Bytes> {
        let stale = self.stale.read().unwrap();
        if *stale {
            return Err(Error::Stale);
        }
        if let Some(generator) = &self.ctx.generator {
            let mut flat = Vec::with_capacity(2 * Hash::BYTES);
            flat.extend_from_slice(addr_hash.as_bytes());
            flat.extend_from_slice(slot_hash.as_bytes());
            if !generator.covers(&flat) {
                return Err(Error::NotCoveredYet);
            }
        }
        {
            let buffer = self.buffer.read().unwrap();
            if let Some(blob) = buffer.storage(addr_hash, slot_hash) {
                metrics::record_dirty_hit();
                return Ok(blob);
            }
        }
        let key = keys::storage_state_key(addr_hash, slot_hash);
        self.read_flat_state(&key)
    }

    fn read_flat_state(&self, key: &[u8]) -> Result<Bytes> {
        if let Some(cache) = &self.ctx.clean_states {
            if let Some(blob) = cache.get(key) {
                metrics::record_clean_state_hit();
                return Ok(blob);
            }
            metrics::record_clean_state_miss();
        }
        let start = Instant::now();
        let raw = self.ctx.kv.get(key)?;
        metrics::record_disk_read(start.elapsed().as_secs_f64());
        match raw {
            Some(raw) => {
                let blob = Bytes::from(raw);
                self.ctx.cache_state(key, blob.clone());
                Ok(blob)
            }
            None => Ok(Bytes::new()),
        }
    }

    /// Merge the bottom-most diff layer into this one.
    ///
    /// Writes the reverse diff first, marks this layer stale, records the
    /// root → id lookup, merges the diff into the buffer and flushes when
    /// full or forced (with the snapshot generator paused around the write).
    /// Returns the replacement disk layer, which inherits buffer and caches.
    pub(crate) fn commit(&self, bottom: &Arc<DiffLayer>, force: bool) -> Result<Arc<DiskLayer>> {
        history::write(&self.ctx, bottom)?;

        self.mark_stale()?;

        let mut batch = WriteBatch::new();
        schema::write_state_id(&mut batch, &bottom.root(), bottom.id());
        self.ctx.kv.write(batch)?;

        {
            let mut buffer = self.buffer.write().unwrap();
            buffer.commit(bottom.nodes().clone(), bottom.states().diff.clone());
            if buffer.is_full() || force {
                if let Some(generator) = &self.ctx.generator {
                    generator.pause();
                }
                let flushed = buffer.flush(
                    &self.ctx,
                    bottom.root(),
                    bottom.id(),
                    self.ctx.generator.as_deref(),
                );
                if let Some(generator) = &self.ctx.generator {
                    generator.resume();
                }
                flushed?;
            }
        }

        tracing::debug!(
            root = %bottom.root(),
            id = bottom.id(),
            block = bottom.block(),
            "merged diff layer into disk"
        );
        Ok(DiskLayer::new(
            bottom.root(),
            bottom.id(),
            self.ctx.clone(),
            self.buffer.clone(),
        ))
    }

    /// Apply a reverse diff, stepping this layer back to its parent state.
    ///
    /// The external solver recomputes the inverse node set from the flat
    /// pre-images. A non-empty buffer absorbs the revert in memory; otherwise
    /// the pre-images go straight to the store in one atomic batch that also
    /// rewinds the persisted id and root.
    pub(crate) fn revert(
        &self,
        entry: &HistoryEntry,
        solver: &dyn ReverseSolver,
    ) -> Result<Arc<DiskLayer>> {
        if entry.root != self.root {
            return Err(Error::UnexpectedHistory {
                want: self.root,
                got: entry.root,
            });
        }
        if self.id == 0 {
            return Err(Error::StateUnrecoverable);
        }
        let start = Instant::now();
        let nodes = solver.apply(
            self.ctx.kv.as_ref(),
            entry.parent_root,
            entry.root,
            &entry.accounts,
            &entry.storages,
        )?;

        self.mark_stale()?;

        let mut buffer = self.buffer.write().unwrap();
        if !buffer.is_empty() {
            let accounts: HashMap<Hash, Bytes> = entry
                .accounts
                .iter()
                .map(|(addr, blob)| (*addr, blob.clone()))
                .collect();
            let storages: HashMap<Hash, HashMap<Hash, Bytes>> = entry
                .storages
                .iter()
                .map(|(addr, slots)| {
                    (
                        *addr,
                        slots.iter().map(|(slot, blob)| (*slot, blob.clone())).collect(),
                    )
                })
                .collect();
            buffer.revert(nodes, accounts, storages)?;
        } else {
            let mut batch = WriteBatch::new();
            for (owner, path, node) in nodes.iter() {
                let key = keys::trie_node_key(owner, path);
                self.ctx.evict_node(&key);
                if node.is_deleted() {
                    batch.delete(key);
                } else {
                    batch.put(key, node.blob.to_vec());
                }
            }
            for (addr, blob) in &entry.accounts {
                let key = keys::account_state_key(addr);
                self.ctx.evict_state(&key);
                if blob.is_empty() {
                    batch.delete(key);
                } else {
                    batch.put(key, blob.to_vec());
                }
            }
            for (addr, slots) in &entry.storages {
                for (slot, blob) in slots {
                    let key = keys::storage_state_key(addr, slot);
                    self.ctx.evict_state(&key);
                    if blob.is_empty() {
                        batch.delete(key);
                    } else {
                        batch.put(key, blob.to_vec());
                    }
                }
            }
            schema::write_persistent_state_id(&mut batch, self.id - 1);
            schema::write_snapshot_root(&mut batch, &entry.parent_root);
            self.ctx.kv.write(batch)?;
        }
        drop(buffer);

        metrics::record_revert(start.elapsed().as_secs_f64());
        tracing::debug!(
            from = %entry.root,
            to = %entry.parent_root,
            id = self.id - 1,
            "reverted disk layer"
        );
        Ok(DiskLayer::new(
            entry.parent_root,
            self.id - 1,
            self.ctx.clone(),
            self.buffer.clone(),
        ))
    }
}
