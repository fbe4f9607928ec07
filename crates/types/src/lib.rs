//! Shared state types for layerdb.
//!
//! This crate defines the value types that flow between the layered state
//! store and its collaborators:
//!
//! - [`Hash`]: 32-byte Keccak-256 hash (state roots, hashed addresses, slots)
//! - [`Node`] / [`NodeSet`]: dirty trie nodes grouped by owning trie
//! - [`StateDiff`] / [`StateSet`]: flat account/storage changes, with or
//!   without the pre-images needed to build reverse diffs
//!
//! The sets are plain in-memory collections with last-writer-wins merge
//! semantics and approximate size accounting; they carry no locking and are
//! immutable by convention once attached to a layer.

#![warn(missing_docs)]

pub mod codec;
mod hash;
mod node;
mod state;

pub use codec::DecodeError;
pub use hash::{Hash, HexError};
pub use node::{Node, NodeSet};
pub use state::{StateDiff, StateSet};

/// Re-export: payload byte buffers used throughout the store.
pub use bytes::Bytes;
