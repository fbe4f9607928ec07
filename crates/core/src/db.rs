//! Top-level database wiring.
//!
//! [`Database`] owns the layer tree and the shared store context, and
//! exposes the whole public surface: block-commit updates, periodic capping,
//! readers, iterators, rollback through the reverse-diff history and the
//! shutdown journal. All mutations funnel through one writer lock; readers
//! go straight to the tree.

use crate::buffer::Buffer;
use crate::disk::DiskLayer;
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::history;
use crate::iterator::{self, MergedIterator};
use crate::journal;
use crate::layer::Layer;
use crate::solver::ReverseSolver;
use crate::tree::LayerTree;
use crate::Config;
use crate::context::StoreContext;
use layerdb_storage::{schema, AppendLog, KvStore, WriteBatch};
use layerdb_types::{Bytes, Hash, NodeSet, StateSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// The layered, content-addressed state store.
pub struct Database {
    ctx: Arc<StoreContext>,
    tree: LayerTree,
    /// Serializes the writer path: update, cap, recover, journal.
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Database {
    /// Open the store over the given backends.
    ///
    /// Reads the persisted anchor, reconciles the reverse-diff history with
    /// it, restores the journaled diff stack if one is present and valid,
    /// and assembles the layer tree.
    pub fn open(
        kv: Arc<dyn KvStore>,
        freezer: Arc<dyn AppendLog>,
        config: Config,
    ) -> Result<Self> {
        Self::open_with_generator(kv, freezer, config, None)
    }

    /// Open with a snapshot generator handle attached.
    ///
    /// Flat-state reads beyond the generator's progress marker fail with
    /// [`Error::NotCoveredYet`] until the external task finishes.
    pub fn open_with_generator(
        kv: Arc<dyn KvStore>,
        freezer: Arc<dyn AppendLog>,
        config: Config,
        generator: Option<Arc<Generator>>,
    ) -> Result<Self> {
        let ctx = Arc::new(StoreContext::with_generator(kv, freezer, config, generator));

        let persistent_id = schema::read_persistent_state_id(ctx.kv.as_ref())?;
        let persistent_root =
            schema::read_snapshot_root(ctx.kv.as_ref())?.unwrap_or(Hash::ZERO);

        let restored = journal::load(&ctx, !ctx.config.read_only)?;
        let (disk, chain) = match restored {
            Some((disk, chain)) => (disk, chain),
            None => {
                let buffer = Buffer::new(ctx.config.write_buffer_size);
                let disk = DiskLayer::new(
                    persistent_root,
                    persistent_id,
                    ctx.clone(),
                    Arc::new(RwLock::new(buffer)),
                );
                (disk, Vec::new())
            }
        };

        if !ctx.config.read_only {
            let aligned = history::repair(&ctx, disk.root())?;
            if aligned != disk.id() {
                tracing::debug!(
                    aligned,
                    disk_id = disk.id(),
                    "state history shorter than disk state"
                );
            }
        }

        tracing::info!(
            root = %disk.root(),
            id = disk.id(),
            layers = chain.len(),
            read_only = ctx.config.read_only,
            "opened layered state store"
        );
        let tree = LayerTree::new(disk, chain);
        Ok(Self {
            ctx,
            tree,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn writable(&self) -> Result<()> {
        if self.ctx.config.read_only || self.closed.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// The layer tree, for direct layer access and inspection.
    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    /// Append the state transition of one executed block.
    ///
    /// Re-adding a known root is a no-op; `root == parent_root` and unknown
    /// parents are rejected.
    pub fn update(
        &self,
        root: Hash,
        parent_root: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSet,
    ) -> Result<()> {
        self.writable()?;
        let _guard = self.write_lock.lock().unwrap();
        self.tree.add(root, parent_root, block, nodes, states)
    }

    /// Retain at most `keep` diff layers below `root`, merging the rest into
    /// the disk layer.
    pub fn cap(&self, root: Hash, keep: usize) -> Result<()> {
        self.writable()?;
        let _guard = self.write_lock.lock().unwrap();
        self.tree.cap(root, keep)
    }

    /// Flatten the whole chain below `root` and force a buffer flush.
    pub fn commit(&self, root: Hash) -> Result<()> {
        self.cap(root, 0)
    }

    /// The layer at `root`, if live.
    pub fn reader(&self, root: &Hash) -> Option<Layer> {
        self.tree.get(root)
    }

    /// Resolve an account read through the per-key lookup index.
    pub fn lookup_account(&self, addr_hash: &Hash, state: &Hash) -> Result<Bytes> {
        self.tree.lookup_account(addr_hash, state)
    }

    /// Resolve a storage read through the per-key lookup index.
    pub fn lookup_storage(
        &self,
        addr_hash: &Hash,
        slot_hash: &Hash,
        state: &Hash,
    ) -> Result<Bytes> {
        self.tree.lookup_storage(addr_hash, slot_hash, state)
    }

    /// Resolve a node read through the per-key lookup index.
    pub fn lookup_node(
        &self,
        owner: &Hash,
        path: &[u8],
        state: &Hash,
    ) -> Result<crate::layer::NodeInfo> {
        self.tree.lookup_node(owner, path, state)
    }

    /// Merged ordered iterator over all accounts visible at `state`,
    /// starting at the first hash `>= seek`.
    pub fn account_iterator(&self, state: Hash, seek: Hash) -> Result<MergedIterator<'_>> {
        iterator::account_iterator(
            &self.tree,
            self.ctx.kv.as_ref(),
            self.generation_done(),
            state,
            seek,
        )
    }

    /// Merged ordered iterator over `account`'s storage visible at `state`,
    /// starting at the first hash `>= seek`.
    pub fn storage_iterator(
        &self,
        state: Hash,
        account: Hash,
        seek: Hash,
    ) -> Result<MergedIterator<'_>> {
        iterator::storage_iterator(
            &self.tree,
            self.ctx.kv.as_ref(),
            self.generation_done(),
            state,
            account,
            seek,
        )
    }

    fn generation_done(&self) -> bool {
        self.ctx.generator.as_ref().is_none_or(|g| g.is_done())
    }

    /// Whether [`recover`](Self::recover) can reach `root`: its state id is
    /// known, lies below the disk layer, and the history back to it is still
    /// retained.
    pub fn recoverable(&self, root: &Hash) -> bool {
        let disk = self.tree.bottom();
        let id = if *root == Hash::ZERO {
            Some(0)
        } else {
            schema::read_state_id(self.ctx.kv.as_ref(), root)
                .ok()
                .flatten()
        };
        let Some(id) = id else {
            return false;
        };
        if id >= disk.id() {
            return false;
        }
        match self.ctx.freezer.tail() {
            Ok(tail) => tail <= id,
            Err(_) => false,
        }
    }

    /// Roll the persisted state back to `target`, one reverse diff at a
    /// time, truncating the history and discarding all in-memory layers.
    pub fn recover(&self, target: Hash, solver: &dyn ReverseSolver) -> Result<()> {
        self.writable()?;
        let _guard = self.write_lock.lock().unwrap();
        if !self.recoverable(&target) {
            return Err(Error::StateUnrecoverable);
        }

        let mut disk = self.tree.bottom();
        while disk.root() != target {
            let entry = history::read(self.ctx.freezer.as_ref(), disk.id())?
                .ok_or(Error::StateUnrecoverable)?;
            disk = disk.revert(&entry, solver)?;
            history::truncate_head(&self.ctx, disk.id())?;
        }
        self.tree.reset(disk);

        // A journal written before the rollback would resurrect dead layers.
        let mut batch = WriteBatch::new();
        schema::delete_journal(&mut batch);
        self.ctx.kv.write(batch)?;

        tracing::info!(root = %target, "recovered state database");
        Ok(())
    }

    /// Serialize the whole layer hierarchy reachable from `head` for the
    /// next startup, then refuse further mutations.
    pub fn journal(&self, head: Hash) -> Result<()> {
        self.writable()?;
        let _guard = self.write_lock.lock().unwrap();
        journal::write(&self.ctx, &self.tree, head)?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Approximate memory usage: `(diff layers, aggregation buffer)` bytes.
    pub fn size(&self) -> (u64, u64) {
        let diffs = self.tree.diff_memory();
        let buffer = self.tree.bottom().buffer().read().unwrap().size();
        (diffs, buffer)
    }

    /// Stop serving mutations and signal the generator task to shut down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(generator) = &self.ctx.generator {
            generator.abort();
        }
    }
}
