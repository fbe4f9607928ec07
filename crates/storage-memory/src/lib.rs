//! In-memory storage backend for layerdb.
//!
//! Implements the `layerdb-storage` contracts over `im::OrdMap`, giving
//! deterministic, dependency-free persistence for tests and simulation with
//! O(1) snapshots.

#![warn(missing_docs)]

mod storage;

pub use storage::{MemoryKv, MemoryLog, MemorySnapshot};
