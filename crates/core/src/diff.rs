//! In-memory diff layers.
//!
//! A diff layer holds the modifications one block made on top of its parent.
//! The node and state maps are immutable after construction; the only mutable
//! pieces are the parent pointer (relinked when the layer below is replaced
//! by a new disk layer) and the stale flag, which is set exactly once.

use crate::disk::DiskLayer;
use crate::error::{Error, Result};
use crate::layer::{Layer, NodeInfo, NodeSource};
use layerdb_metrics as metrics;
use layerdb_types::{Bytes, Hash, Node, NodeSet, StateSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A collection of modifications made on top of an existing layer.
pub struct DiffLayer {
    root: Hash,
    id: u64,
    block: u64,
    parent: RwLock<Layer>,
    nodes: NodeSet,
    states: StateSet,
    memory: u64,
    stale: AtomicBool,
}

impl DiffLayer {
    /// Create a new diff on top of `parent`.
    pub(crate) fn new(
        parent: Layer,
        root: Hash,
        id: u64,
        block: u64,
        nodes: NodeSet,
        states: StateSet,
    ) -> Arc<Self> {
        let memory = nodes.size() + states.size();
        metrics::record_layer_added(nodes.len(), states.diff.len(), memory);
        tracing::debug!(
            root = %root,
            id,
            block,
            nodes = nodes.len(),
            states = states.diff.len(),
            size = memory,
            "created new diff layer"
        );
        Arc::new(Self {
            root,
            id,
            block,
            parent: RwLock::new(parent),
            nodes,
            states,
            memory,
            stale: AtomicBool::new(false),
        })
    }

    /// The state root this layer represents.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// The monotone state id of this layer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The block number that produced this layer.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Approximate in-memory footprint in bytes.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    /// The layer's local node set.
    pub(crate) fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// The layer's local state set with origins.
    pub(crate) fn states(&self) -> &StateSet {
        &self.states
    }

    /// The current parent handle.
    pub fn parent_layer(&self) -> Layer {
        self.parent.read().unwrap().clone()
    }

    /// Relink the parent after the layer below was replaced.
    pub(crate) fn set_parent(&self, parent: Layer) {
        *self.parent.write().unwrap() = parent;
    }

    /// Whether this layer was flattened into the disk layer.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Local node lookup, bypassing the parent chain.
    pub(crate) fn node_local(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.node(owner, path)
    }

    /// Local account lookup, bypassing the parent chain.
    pub(crate) fn account_local(&self, addr_hash: &Hash) -> Option<Bytes> {
        self.states.diff.account(addr_hash)
    }

    /// Local storage lookup, bypassing the parent chain.
    pub(crate) fn storage_local(&self, addr_hash: &Hash, slot_hash: &Hash) -> Option<Bytes> {
        self.states.diff.storage(addr_hash, slot_hash)
    }

    /// Read a trie node, chasing parents on local miss.
    pub(crate) fn read_node(&self, owner: &Hash, path: &[u8], depth: usize) -> Result<NodeInfo> {
        // A flattened layer must not serve reads; the caller re-acquires the
        // same state through the tree.
        if self.is_stale() {
            return Err(Error::Stale);
        }
        if let Some(node) = self.nodes.node(owner, path) {
            metrics::record_diff_hit(depth);
            return Ok(NodeInfo {
                blob: node.blob.clone(),
                hash: node.hash,
                source: NodeSource::Diff,
            });
        }
        match self.parent_layer() {
            Layer::Diff(parent) => parent.read_node(owner, path, depth + 1),
            Layer::Disk(parent) => parent.read_node(owner, path),
        }
    }

    /// Read a flat account payload, chasing parents on local miss.
    pub(crate) fn read_account(&self, addr_hash: &Hash, depth: usize) -> Result<Bytes> {
        if self.is_stale() {
            return Err(Error::Stale);
        }
        if let Some(blob) = self.states.diff.account(addr_hash) {
            metrics::record_diff_hit(depth);
            return Ok(blob);
        }
        match self.parent_layer() {
            Layer::Diff(parent) => parent.read_account(addr_hash, depth + 1),
            Layer::Disk(parent) => parent.read_account(addr_hash),
        }
    }

    /// Read a flat storage payload, chasing parents on local miss.
    pub(crate) fn read_storage(
        &self,
        addr_hash: &Hash,
        slot_hash: &Hash,
        depth: usize,
    ) -> Result<Bytes> {
        if self.is_stale() {
            return Err(Error::Stale);
        }
        if let Some(blob) = self.states.diff.storage(addr_hash, slot_hash) {
            metrics::record_diff_hit(depth);
            return Ok(blob);
        }
        match self.parent_layer() {
            Layer::Diff(parent) => parent.read_storage(addr_hash, slot_hash, depth + 1),
            Layer::Disk(parent) => parent.read_storage(addr_hash, slot_hash),
        }
    }

    /// Flatten this layer and everything below it into the disk layer,
    /// bottom-up, committing one transition at a time so every state id gets
    /// its own history entry.
    ///
    /// Returns the new disk layer, rooted at this layer's root. Every
    /// flattened diff is marked stale exactly once; flattening the same layer
    /// from two children is a fatal invariant violation.
    pub(crate) fn persist(self: &Arc<Self>, force: bool) -> Result<Arc<DiskLayer>> {
        let disk = match self.parent_layer() {
            Layer::Diff(parent) => {
                let disk = parent.persist(force)?;
                self.set_parent(Layer::Disk(disk.clone()));
                disk
            }
            Layer::Disk(disk) => disk,
        };
        let new_disk = disk.commit(self, force)?;
        if self.stale.swap(true, Ordering::AcqRel) {
            panic!("diff layer {} flattened twice", self.root);
        }
        Ok(new_disk)
    }
}
