//! Storage contracts for layerdb.
//!
//! This crate defines the persistence abstraction the layered state store is
//! built on, along with the key schema both backends share.
//!
//! # Design
//!
//! Persistence is an implementation detail of the embedding process, not of
//! the state store. The store sees two capabilities:
//!
//! - [`KvStore`]: an ordered key-value namespace with point reads, prefix
//!   scans, point-in-time snapshots and atomic [`WriteBatch`] writes. Flush
//!   atomicity and crash consistency hang entirely off batch atomicity.
//! - [`AppendLog`]: the reverse-diff freezer — contiguous 1-based ids,
//!   head truncation (chain re-orgs) and tail truncation (bounded history).
//!
//! Backends implement the traits directly: `layerdb-storage-memory` for
//! tests and simulation, `layerdb-storage-rocksdb` for production.
//!
//! [`keys`] fixes the byte layout of every record family, and [`schema`]
//! layers typed read/write helpers on top so callers never hand-build keys.

#![warn(missing_docs)]

mod batch;
mod error;
pub mod keys;
pub mod schema;
mod store;

pub use batch::{BatchOp, WriteBatch};
pub use error::StoreError;
pub use store::{AppendLog, KvRead, KvStore};
