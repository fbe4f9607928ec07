//! The polymorphic layer handle.
//!
//! A layer is a full-state snapshot at one block: either the single disk
//! layer at the bottom or an in-memory diff layer stacked on top. Handles are
//! tagged `Arc`s, cheap to clone and safe to hold across tree mutations — a
//! handle that outlives its layer keeps answering until it observes the stale
//! flag, then fails with [`Error::Stale`](crate::Error::Stale) and must be
//! re-acquired through the tree.

use crate::diff::DiffLayer;
use crate::disk::DiskLayer;
use crate::error::Result;
use layerdb_types::{Bytes, Hash, NodeSet, StateSet};
use std::sync::Arc;

/// Where a node read was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSource {
    /// The disk layer's aggregation buffer.
    DirtyBuffer,
    /// The clean node cache.
    CleanCache,
    /// The key-value store.
    Disk,
    /// A diff layer's local node set.
    Diff,
}

/// Result of a node read.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Encoded node payload; empty if the node is deleted or missing.
    pub blob: Bytes,
    /// Keccak-256 of the payload, zero if empty.
    pub hash: Hash,
    /// Which tier answered.
    pub source: NodeSource,
}

impl NodeInfo {
    /// A read that found nothing; missing nodes are not an error.
    pub fn missing() -> Self {
        Self {
            blob: Bytes::new(),
            hash: Hash::ZERO,
            source: NodeSource::Disk,
        }
    }

    /// Whether the read yielded no payload (deleted or never existed).
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }
}

/// A snapshot of the full state at a particular block.
#[derive(Clone)]
pub enum Layer {
    /// The persistent bottom layer.
    Disk(Arc<DiskLayer>),
    /// An in-memory overlay.
    Diff(Arc<DiffLayer>),
}

impl Layer {
    /// The state root this layer represents.
    pub fn root(&self) -> Hash {
        match self {
            Layer::Disk(l) => l.root(),
            Layer::Diff(l) => l.root(),
        }
    }

    /// The monotone state id of this layer.
    pub fn id(&self) -> u64 {
        match self {
            Layer::Disk(l) => l.id(),
            Layer::Diff(l) => l.id(),
        }
    }

    /// The parent layer, `None` for the disk layer.
    pub fn parent(&self) -> Option<Layer> {
        match self {
            Layer::Disk(_) => None,
            Layer::Diff(l) => Some(l.parent_layer()),
        }
    }

    /// Whether the layer was flattened or replaced.
    pub fn is_stale(&self) -> bool {
        match self {
            Layer::Disk(l) => l.is_stale(),
            Layer::Diff(l) => l.is_stale(),
        }
    }

    /// Read a trie node by owner and path.
    ///
    /// Missing nodes answer an empty payload without error.
    pub fn read_node(&self, owner: &Hash, path: &[u8]) -> Result<NodeInfo> {
        match self {
            Layer::Disk(l) => l.read_node(owner, path),
            Layer::Diff(l) => l.read_node(owner, path, 0),
        }
    }

    /// Read a flat account payload; empty bytes if absent.
    pub fn read_account(&self, addr_hash: &Hash) -> Result<Bytes> {
        match self {
            Layer::Disk(l) => l.read_account(addr_hash),
            Layer::Diff(l) => l.read_account(addr_hash, 0),
        }
    }

    /// Read a flat storage payload; empty bytes if absent.
    pub fn read_storage(&self, addr_hash: &Hash, slot_hash: &Hash) -> Result<Bytes> {
        match self {
            Layer::Disk(l) => l.read_storage(addr_hash, slot_hash),
            Layer::Diff(l) => l.read_storage(addr_hash, slot_hash, 0),
        }
    }

    /// Stack a new diff layer on top of this one. Never mutates `self`.
    pub fn update(
        &self,
        root: Hash,
        id: u64,
        block: u64,
        nodes: NodeSet,
        states: StateSet,
    ) -> Arc<DiffLayer> {
        DiffLayer::new(self.clone(), root, id, block, nodes, states)
    }
}
