//! The layer tree.
//!
//! Owns every live layer, the descendants closure and the per-key lookup
//! index, all under one reader-writer lock. `add` and `cap` serialize on the
//! write side; queries share the read side. A reader that observes a new disk
//! layer root also observes the matching lookup and descendants state.

use crate::diff::DiffLayer;
use crate::disk::DiskLayer;
use crate::error::{Error, Result};
use crate::layer::{Layer, NodeInfo, NodeSource};
use crate::lookup::{Descendants, Lookup};
use layerdb_metrics as metrics;
use layerdb_types::{Bytes, Hash, NodeSet, StateSet};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct TreeInner {
    base: Arc<DiskLayer>,
    layers: HashMap<Hash, Layer>,
    descendants: Descendants,
    lookup: Lookup,
}

impl TreeInner {
    /// Index a freshly created (already linked) diff layer.
    fn link(&mut self, diff: Arc<DiffLayer>) {
        let root = diff.root();
        let mut ancestor = diff.parent_layer();
        loop {
            match ancestor {
                Layer::Diff(parent) => {
                    self.descendants.entry(parent.root()).or_default().insert(root);
                    ancestor = parent.parent_layer();
                }
                Layer::Disk(_) => break,
            }
        }
        self.lookup.add_layer(&diff);
        self.layers.insert(root, Layer::Diff(diff));
    }

    /// Forget a root entirely: layer map, descendants closure, both sides.
    fn purge(&mut self, root: &Hash) {
        self.layers.remove(root);
        self.descendants.remove(root);
        for set in self.descendants.values_mut() {
            set.remove(root);
        }
    }
}

/// The tree of state layers: one disk layer, any number of diffs above.
pub struct LayerTree {
    inner: RwLock<TreeInner>,
}

impl LayerTree {
    /// Build a tree over `base` with an optional restored chain, ordered
    /// parent-first and already linked bottom-up.
    pub(crate) fn new(base: Arc<DiskLayer>, chain: Vec<Arc<DiffLayer>>) -> Self {
        let mut inner = TreeInner {
            layers: HashMap::from([(base.root(), Layer::Disk(base.clone()))]),
            base,
            descendants: Descendants::new(),
            lookup: Lookup::new(),
        };
        for diff in chain {
            inner.link(diff);
        }
        metrics::set_layer_count(inner.layers.len());
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// The layer at `root`, if live.
    pub fn get(&self, root: &Hash) -> Option<Layer> {
        let inner = self.inner.read().unwrap();
        inner
            .layers
            .get(root)
            .filter(|layer| !layer.is_stale())
            .cloned()
    }

    /// The disk layer at the bottom.
    pub fn bottom(&self) -> Arc<DiskLayer> {
        self.inner.read().unwrap().base.clone()
    }

    /// Number of live layers, disk layer included.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().layers.len()
    }

    /// Whether the tree holds only the disk layer.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Whether `root` reaches `ancestor` by chasing parent links.
    pub fn is_descendant(&self, ancestor: &Hash, root: &Hash) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .descendants
            .get(ancestor)
            .is_some_and(|set| set.contains(root))
    }

    /// Total in-memory footprint of the diff layers.
    pub fn diff_memory(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner
            .layers
            .values()
            .map(|layer| match layer {
                Layer::Diff(diff) => diff.memory(),
                Layer::Disk(_) => 0,
            })
            .sum()
    }

    /// Append a new diff layer on top of `parent_root`.
    ///
    /// Re-adding a known root is a no-op (a re-executed block); an unknown
    /// parent or a self-parent is rejected.
    pub(crate) fn add(
        &self,
        root: Hash,
        parent_root: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSet,
    ) -> Result<()> {
        if root == parent_root {
            return Err(Error::LayerCycle(root));
        }
        let mut inner = self.inner.write().unwrap();
        if inner.layers.contains_key(&root) {
            return Ok(());
        }
        let parent = inner
            .layers
            .get(&parent_root)
            .cloned()
            .ok_or(Error::ParentMissing(parent_root))?;
        let diff = parent.update(root, parent.id() + 1, block, nodes, states);
        inner.link(diff);
        metrics::set_layer_count(inner.layers.len());
        Ok(())
    }

    /// Retain at most `keep` diff layers on the path below `root`, merging
    /// everything deeper into the disk layer. `keep == 0` forces a full
    /// flush of the whole chain.
    pub(crate) fn cap(&self, root: Hash, keep: usize) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let diff = match inner.layers.get(&root) {
            Some(Layer::Diff(diff)) => diff.clone(),
            // The disk layer cannot be capped; an unknown root has nothing
            // to cap either.
            Some(Layer::Disk(_)) | None => return Err(Error::ParentMissing(root)),
        };

        if keep == 0 {
            let flattened = self.chain_below(&Layer::Diff(diff.clone()));
            let new_base = diff.persist(true)?;
            metrics::record_layers_flattened(flattened.len() + 1);
            inner.base = new_base.clone();
            inner.layers = HashMap::from([(new_base.root(), Layer::Disk(new_base))]);
            inner.descendants.clear();
            inner.lookup = Lookup::new();
            metrics::set_layer_count(1);
            tracing::debug!(root = %root, "flushed layer tree to disk");
            return Ok(());
        }

        // Walk down keep-1 hops; running into the disk layer means the chain
        // is already within bounds.
        let mut last_kept = diff;
        for _ in 0..keep - 1 {
            match last_kept.parent_layer() {
                Layer::Diff(parent) => last_kept = parent,
                Layer::Disk(_) => return Ok(()),
            }
        }
        let bottom = match last_kept.parent_layer() {
            Layer::Diff(parent) => parent,
            Layer::Disk(_) => return Ok(()),
        };

        let flattened = {
            let mut chain = vec![bottom.clone()];
            chain.extend(self.chain_below(&Layer::Diff(bottom.clone())));
            chain
        };
        let new_base = bottom.persist(false)?;
        metrics::record_layers_flattened(flattened.len());

        inner.base = new_base.clone();
        inner
            .layers
            .insert(new_base.root(), Layer::Disk(new_base.clone()));
        for diff in &flattened {
            inner.lookup.remove_layer(diff)?;
            if diff.root() != new_base.root() {
                inner.purge(&diff.root());
            } else {
                inner.descendants.remove(&diff.root());
                for set in inner.descendants.values_mut() {
                    set.remove(&diff.root());
                }
            }
        }

        // Survivors sitting directly on the flattened top get relinked onto
        // the replacement disk layer.
        for layer in inner.layers.values() {
            if let Layer::Diff(diff) = layer {
                let parent = diff.parent_layer();
                if parent.is_stale() && parent.root() == new_base.root() {
                    diff.set_parent(Layer::Disk(new_base.clone()));
                }
            }
        }

        // Anything still chained onto a stale layer lost its whole ancestry.
        let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();
        for (root, layer) in &inner.layers {
            if let Layer::Diff(diff) = layer {
                children
                    .entry(diff.parent_layer().root())
                    .or_default()
                    .push(*root);
            }
        }
        let mut queue: Vec<Hash> = inner
            .layers
            .iter()
            .filter_map(|(root, layer)| match layer {
                Layer::Diff(diff) if diff.parent_layer().is_stale() => Some(*root),
                _ => None,
            })
            .collect();
        while let Some(dead) = queue.pop() {
            if let Some(Layer::Diff(diff)) = inner.layers.get(&dead).cloned() {
                inner.lookup.remove_layer(&diff)?;
                inner.purge(&dead);
                if let Some(orphans) = children.get(&dead) {
                    queue.extend(orphans.iter().copied());
                }
            }
        }

        metrics::set_layer_count(inner.layers.len());
        Ok(())
    }

    /// The diff chain strictly below `layer`, top-down, ending above disk.
    fn chain_below(&self, layer: &Layer) -> Vec<Arc<DiffLayer>> {
        let mut chain = Vec::new();
        let mut current = layer.parent();
        while let Some(Layer::Diff(diff)) = current {
            current = Some(diff.parent_layer());
            chain.push(diff);
        }
        chain
    }

    /// Replace the whole tree with a single disk layer.
    pub(crate) fn reset(&self, base: Arc<DiskLayer>) {
        let mut inner = self.inner.write().unwrap();
        inner.layers = HashMap::from([(base.root(), Layer::Disk(base.clone()))]);
        inner.base = base;
        inner.descendants.clear();
        inner.lookup = Lookup::new();
        metrics::set_layer_count(1);
    }

    /// The diff chain from `head` down to the disk layer, parent-first.
    pub(crate) fn journal_chain(&self, head: Hash) -> Result<Vec<Arc<DiffLayer>>> {
        let inner = self.inner.read().unwrap();
        let layer = inner
            .layers
            .get(&head)
            .cloned()
            .ok_or(Error::ParentMissing(head))?;
        let mut chain = Vec::new();
        let mut current = layer;
        while let Layer::Diff(diff) = current {
            current = diff.parent_layer();
            chain.push(diff);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Resolve an account read for `state` through the lookup index.
    ///
    /// Equivalent to `get(state)?.read_account(..)` but O(lg N): the index
    /// names the topmost modifying ancestor directly, and only a never-
    /// modified key falls through to the disk layer.
    pub fn lookup_account(&self, addr_hash: &Hash, state: &Hash) -> Result<Bytes> {
        let inner = self.inner.read().unwrap();
        if !inner.layers.contains_key(state) {
            return Err(Error::Stale);
        }
        match inner.lookup.account_tip(addr_hash, state, &inner.descendants) {
            Some(tip) => {
                if tip.destructed {
                    return Ok(Bytes::new());
                }
                let layer = self.diff_at(&inner, &tip.root)?;
                Ok(layer.account_local(addr_hash).unwrap_or_default())
            }
            None => {
                let base = inner.base.clone();
                drop(inner);
                base.read_account(addr_hash)
            }
        }
    }

    /// Resolve a storage read for `state` through the lookup index.
    pub fn lookup_storage(&self, addr_hash: &Hash, slot_hash: &Hash, state: &Hash) -> Result<Bytes> {
        let inner = self.inner.read().unwrap();
        if !inner.layers.contains_key(state) {
            return Err(Error::Stale);
        }
        match inner
            .lookup
            .storage_tip(addr_hash, slot_hash, state, &inner.descendants)
        {
            Some(tip) => {
                if tip.destructed {
                    return Ok(Bytes::new());
                }
                let layer = self.diff_at(&inner, &tip.root)?;
                Ok(layer.storage_local(addr_hash, slot_hash).unwrap_or_default())
            }
            None => {
                let base = inner.base.clone();
                drop(inner);
                base.read_storage(addr_hash, slot_hash)
            }
        }
    }

    /// Resolve a node read for `state` through the lookup index.
    pub fn lookup_node(&self, owner: &Hash, path: &[u8], state: &Hash) -> Result<NodeInfo> {
        let inner = self.inner.read().unwrap();
        if !inner.layers.contains_key(state) {
            return Err(Error::Stale);
        }
        match inner.lookup.node_tip(owner, path, state, &inner.descendants) {
            Some(root) => {
                let layer = self.diff_at(&inner, &root)?;
                let node = layer.node_local(owner, path).ok_or_else(|| {
                    Error::CorruptedIndex(format!("lookup names layer {root} without the node"))
                })?;
                Ok(NodeInfo {
                    blob: node.blob.clone(),
                    hash: node.hash,
                    source: NodeSource::Diff,
                })
            }
            None => {
                let base = inner.base.clone();
                drop(inner);
                base.read_node(owner, path)
            }
        }
    }

    fn diff_at(&self, inner: &TreeInner, root: &Hash) -> Result<Arc<DiffLayer>> {
        match inner.layers.get(root) {
            Some(Layer::Diff(diff)) => Ok(diff.clone()),
            _ => Err(Error::CorruptedIndex(format!(
                "lookup references missing layer {root}"
            ))),
        }
    }
}
