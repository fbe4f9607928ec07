//! Layered, content-addressed state store.
//!
//! The store maintains an append-only tree of *state layers*, each a full
//! snapshot of chain state at one block. Writers extend the tree by stacking
//! a diff layer on a parent; readers query state at any live layer. At the
//! bottom sits a single disk layer: an aggregation buffer batching many
//! transitions into one atomic flush, two clean caches, and the persistent
//! key-value store. Alongside, a reverse-diff history makes any persisted
//! state revertible by a bounded number of blocks.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────┐
//!                 │  DiffLayer │   in-memory overlays, immutable,
//!                 ├────────────┤   parent-linked, indexed by Lookup
//!                 │  DiffLayer │
//!                 ├────────────┤
//!                 │  DiskLayer │── Buffer ── clean caches ── KvStore
//!                 └────────────┘            └─ reverse diffs ─ AppendLog
//! ```
//!
//! - [`Database`] wires everything together and owns the writer path.
//! - [`LayerTree`] tracks live layers, the descendants closure and the
//!   per-key [`lookup`](Database::lookup_account) index.
//! - `cap` flattens old diff layers into the disk layer; a full buffer
//!   flushes to the store in one atomic batch.
//! - The history log records flat pre-images per transition;
//!   [`Database::recover`] walks it backwards through the external
//!   [`ReverseSolver`].
//! - [`MergedIterator`] streams the combined state ordered by hash.
//! - The journal persists the diff stack across restarts.
//!
//! The store is synchronous: many concurrent readers, one writer path,
//! shared-memory locks. No async.

#![warn(missing_docs)]

mod buffer;
mod config;
mod context;
mod db;
mod diff;
mod disk;
mod error;
mod generator;
mod history;
mod iterator;
mod journal;
mod layer;
mod lookup;
mod solver;
mod tree;

pub use config::Config;
pub use db::Database;
pub use diff::DiffLayer;
pub use disk::DiskLayer;
pub use error::{Error, Result};
pub use generator::Generator;
pub use history::HistoryEntry;
pub use iterator::MergedIterator;
pub use layer::{Layer, NodeInfo, NodeSource};
pub use solver::ReverseSolver;
pub use tree::LayerTree;
