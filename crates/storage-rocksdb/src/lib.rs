//! RocksDB storage backend for layerdb.
//!
//! Implements the `layerdb-storage` contracts over a single RocksDB database
//! with dedicated column families for the key-value namespace and the
//! reverse-diff append log.

#![warn(missing_docs)]

mod storage;

pub use storage::{RocksDb, RocksDbConfig, RocksKv, RocksLog, RocksSnapshot};
