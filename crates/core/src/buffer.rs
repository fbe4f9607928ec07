//! The aggregation buffer owned by the disk layer.
//!
//! Each committed diff layer is merged in here instead of hitting the
//! key-value store directly; once the accumulated footprint crosses the
//! configured threshold (or a flush is forced), everything goes out in one
//! atomic batch that also advances the persisted state id and root. Between
//! flushes the buffer doubles as the hottest read tier of the disk layer.

use crate::context::StoreContext;
use crate::error::{Error, Result};
use crate::generator::Generator;
use layerdb_storage::{keys, schema, KvRead, KvStore, WriteBatch};
use layerdb_types::{Bytes, Hash, Node, NodeSet, StateDiff};
use std::collections::HashMap;
use std::time::Instant;

/// Aggregated writes of `layers` consecutive state transitions.
pub struct Buffer {
    layers: u64,
    limit: u64,
    nodes: NodeSet,
    states: StateDiff,
}

impl Buffer {
    /// An empty buffer flushing at `limit` bytes.
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            layers: 0,
            limit,
            nodes: NodeSet::new(),
            states: StateDiff::new(),
        }
    }

    /// Rebuild a buffer from journaled content.
    pub(crate) fn with_content(limit: u64, layers: u64, nodes: NodeSet, states: StateDiff) -> Self {
        Self {
            layers,
            limit,
            nodes,
            states,
        }
    }

    /// Number of transitions merged since the last flush.
    pub fn layers(&self) -> u64 {
        self.layers
    }

    /// Approximate footprint of the merged sets in bytes.
    pub fn size(&self) -> u64 {
        self.nodes.size() + self.states.size()
    }

    /// Whether the footprint crossed the flush threshold.
    pub fn is_full(&self) -> bool {
        self.size() > self.limit
    }

    /// Whether no transition is buffered.
    pub fn is_empty(&self) -> bool {
        self.layers == 0
    }

    /// The merged node set (journal serialization).
    pub(crate) fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// The merged state diff (journal serialization and disk-layer reads).
    pub(crate) fn states(&self) -> &StateDiff {
        &self.states
    }

    /// Buffered trie node at `(owner, path)`, tombstones included.
    pub(crate) fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.node(owner, path)
    }

    /// Buffered account payload, `Some(empty)` for deletions.
    pub(crate) fn account(&self, addr_hash: &Hash) -> Option<Bytes> {
        self.states.account(addr_hash)
    }

    /// Buffered storage payload, `Some(empty)` for deletions.
    pub(crate) fn storage(&self, addr_hash: &Hash, slot_hash: &Hash) -> Option<Bytes> {
        self.states.storage(addr_hash, slot_hash)
    }

    /// Merge one more transition into the buffer, last-writer-wins.
    pub(crate) fn commit(&mut self, nodes: NodeSet, states: StateDiff) {
        self.nodes.merge(nodes);
        self.states.merge(states);
        self.layers += 1;
        layerdb_metrics::set_buffer_size(self.size());
    }

    /// Undo the newest buffered transition using its reverse diff.
    ///
    /// Reverting the only remaining transition resets the buffer outright:
    /// the disk content below is exactly the target state.
    pub(crate) fn revert(
        &mut self,
        nodes: NodeSet,
        accounts: HashMap<Hash, Bytes>,
        storages: HashMap<Hash, HashMap<Hash, Bytes>>,
    ) -> Result<()> {
        if self.layers == 0 {
            return Err(Error::StateUnrecoverable);
        }
        self.layers -= 1;
        if self.layers == 0 {
            self.nodes.clear();
            self.states.clear();
            layerdb_metrics::set_buffer_size(0);
            return Ok(());
        }
        for (owner, path, node) in nodes.iter() {
            if !self.nodes.contains(owner, path) {
                return Err(Error::CorruptedIndex(format!(
                    "reverting non-existent buffered node ({owner} {path:02x?})"
                )));
            }
            self.nodes.insert(*owner, path.clone(), node.clone());
        }
        self.states.apply_origin(accounts, storages);
        layerdb_metrics::set_buffer_size(self.size());
        Ok(())
    }

    /// Persist the buffer in one atomic batch and reset it.
    ///
    /// The batch carries every buffered node and state record together with
    /// the new persisted state id and root; flat-state records beyond the
    /// snapshot generator's progress marker are skipped (the generator will
    /// produce them from the flushed trie). The shutdown signal is honored
    /// between per-key writes; the final batch write is not cancellable.
    pub(crate) fn flush(
        &mut self,
        ctx: &StoreContext,
        root: Hash,
        id: u64,
        generator: Option<&Generator>,
    ) -> Result<()> {
        let persistent_id = schema::read_persistent_state_id(ctx.kv.as_ref())?;
        if persistent_id + self.layers != id {
            return Err(Error::CorruptedIndex(format!(
                "gapped buffer layers: persisted id {persistent_id} + {} layers != {id}",
                self.layers
            )));
        }
        let start = Instant::now();
        let marker = generator.and_then(|g| g.marker());
        let covered = |key: &[u8]| match &marker {
            Some(m) => key <= m.as_slice(),
            None => true,
        };
        let aborted = || generator.is_some_and(|g| g.is_aborted());

        let mut batch = WriteBatch::new();
        let total_nodes = self.nodes.len();

        for (owner, path, node) in self.nodes.iter() {
            if aborted() {
                return Err(Error::Aborted);
            }
            let key = keys::trie_node_key(owner, path);
            if node.is_deleted() {
                ctx.evict_node(&key);
                batch.delete(key);
            } else {
                ctx.cache_node(&key, node.blob.clone());
                batch.put(key, node.blob.to_vec());
            }
        }

        // A destruct wipes the flat account record and every persisted slot;
        // rewrites from the same or later transitions land right after.
        for addr in self.states.destructs() {
            if aborted() {
                return Err(Error::Aborted);
            }
            ctx.evict_state(&keys::account_state_key(addr));
            schema::delete_account_state(&mut batch, addr);
            let prefix = keys::storage_state_prefix(addr);
            for (key, _) in ctx.kv.iter_from(&prefix, &prefix) {
                ctx.evict_state(&key);
                batch.delete(key);
            }
        }
        for (addr, blob) in self.states.accounts() {
            if aborted() {
                return Err(Error::Aborted);
            }
            if !covered(addr.as_bytes()) {
                continue;
            }
            let key = keys::account_state_key(addr);
            if blob.is_empty() {
                ctx.evict_state(&key);
                batch.delete(key);
            } else {
                ctx.cache_state(&key, blob.clone());
                batch.put(key, blob.to_vec());
            }
        }
        for (addr, slots) in self.states.storages() {
            for (slot, blob) in slots {
                if aborted() {
                    return Err(Error::Aborted);
                }
                let mut flat = Vec::with_capacity(2 * Hash::BYTES);
                flat.extend_from_slice(addr.as_bytes());
                flat.extend_from_slice(slot.as_bytes());
                if !covered(&flat) {
                    continue;
                }
                let key = keys::storage_state_key(addr, slot);
                if blob.is_empty() {
                    ctx.evict_state(&key);
                    batch.delete(key);
                } else {
                    ctx.cache_state(&key, blob.clone());
                    batch.put(key, blob.to_vec());
                }
            }
        }

        schema::write_persistent_state_id(&mut batch, id);
        schema::write_snapshot_root(&mut batch, &root);

        if aborted() {
            return Err(Error::Aborted);
        }
        let bytes = batch.size();
        ctx.kv.write(batch)?;

        let elapsed = start.elapsed();
        layerdb_metrics::record_buffer_flush(total_nodes, bytes, elapsed.as_secs_f64());
        tracing::debug!(
            id,
            root = %root,
            layers = self.layers,
            nodes = total_nodes,
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "flushed aggregation buffer"
        );

        self.layers = 0;
        self.nodes.clear();
        self.states.clear();
        layerdb_metrics::set_buffer_size(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerdb_storage_memory::MemoryLog;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn hash(n: u8) -> Hash {
        Hash::from([n; 32])
    }

    fn ctx() -> StoreContext {
        StoreContext::new(
            Arc::new(layerdb_storage_memory::MemoryKv::new()),
            Arc::new(MemoryLog::new()),
            crate::Config {
                clean_node_cache_size: 0,
                clean_state_cache_size: 0,
                ..Default::default()
            },
        )
    }

    fn one_account(addr: Hash, val: &'static [u8]) -> StateDiff {
        let mut diff = StateDiff::new();
        diff.insert_account(addr, Bytes::from_static(val));
        diff
    }

    #[test]
    fn test_commit_counts_layers_and_merges() {
        let mut buffer = Buffer::new(u64::MAX);
        buffer.commit(NodeSet::new(), one_account(hash(1), b"v1"));
        buffer.commit(NodeSet::new(), one_account(hash(1), b"v2"));

        assert_eq!(buffer.layers(), 2);
        assert_eq!(buffer.account(&hash(1)).unwrap().as_ref(), b"v2");
    }

    #[test]
    fn test_flush_writes_atomically_and_resets() {
        let ctx = ctx();
        let mut buffer = Buffer::new(u64::MAX);

        let mut nodes = NodeSet::new();
        nodes.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"n1")));
        buffer.commit(nodes, one_account(hash(1), b"v1"));

        let root = hash(0xAA);
        buffer.flush(&ctx, root, 1, None).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(schema::read_persistent_state_id(ctx.kv.as_ref()).unwrap(), 1);
        assert_eq!(schema::read_snapshot_root(ctx.kv.as_ref()).unwrap(), Some(root));
        assert_eq!(
            schema::read_account_state(ctx.kv.as_ref(), &hash(1)).unwrap().unwrap(),
            b"v1"
        );
        assert_eq!(
            schema::read_trie_node(ctx.kv.as_ref(), &Hash::ZERO, &[0x01]).unwrap().unwrap(),
            b"n1"
        );
    }

    #[test]
    fn test_flush_rejects_gapped_id() {
        let ctx = ctx();
        let mut buffer = Buffer::new(u64::MAX);
        buffer.commit(NodeSet::new(), one_account(hash(1), b"v1"));

        assert!(matches!(
            buffer.flush(&ctx, hash(0xAA), 5, None),
            Err(Error::CorruptedIndex(_))
        ));
    }

    #[test]
    fn test_flush_destruct_wipes_persisted_slots() {
        let ctx = ctx();

        // Persist one slot directly, as if written by an earlier flush.
        let mut batch = WriteBatch::new();
        schema::write_storage_state(&mut batch, &hash(1), &hash(5), b"old");
        ctx.kv.write(batch).unwrap();

        let mut buffer = Buffer::new(u64::MAX);
        buffer.commit(
            NodeSet::new(),
            StateDiff::from_parts(
                [hash(1)].into_iter().collect::<HashSet<_>>(),
                Default::default(),
                Default::default(),
            ),
        );
        buffer.flush(&ctx, hash(0xAA), 1, None).unwrap();

        assert_eq!(
            schema::read_storage_state(ctx.kv.as_ref(), &hash(1), &hash(5)).unwrap(),
            None
        );
    }

    #[test]
    fn test_revert_last_layer_resets() {
        let mut buffer = Buffer::new(u64::MAX);
        buffer.commit(NodeSet::new(), one_account(hash(1), b"v1"));

        buffer
            .revert(NodeSet::new(), Default::default(), Default::default())
            .unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.account(&hash(1)), None);

        assert!(matches!(
            buffer.revert(NodeSet::new(), Default::default(), Default::default()),
            Err(Error::StateUnrecoverable)
        ));
    }

    #[test]
    fn test_revert_restores_preimages() {
        let mut buffer = Buffer::new(u64::MAX);
        let mut nodes = NodeSet::new();
        nodes.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"n1")));
        buffer.commit(nodes, one_account(hash(1), b"v1"));

        let mut nodes = NodeSet::new();
        nodes.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"n2")));
        buffer.commit(nodes, one_account(hash(1), b"v2"));

        let mut reverse_nodes = NodeSet::new();
        reverse_nodes.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"n1")));
        buffer
            .revert(
                reverse_nodes,
                [(hash(1), Bytes::from_static(b"v1"))].into_iter().collect(),
                Default::default(),
            )
            .unwrap();

        assert_eq!(buffer.layers(), 1);
        assert_eq!(buffer.account(&hash(1)).unwrap().as_ref(), b"v1");
        assert_eq!(buffer.node(&Hash::ZERO, &[0x01]).unwrap().blob.as_ref(), b"n1");
    }
}
