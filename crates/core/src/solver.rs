//! External trie solver contract.
//!
//! Reverting a persisted state needs the inverse *node* set for a reverse
//! *state* diff: given the flat pre-images of everything a transition touched,
//! something that understands the trie structure must recompute which nodes
//! change when the transition is undone. That something lives outside this
//! crate; the store only defines the contract and feeds it a read view of the
//! current disk state.

use crate::error::Result;
use layerdb_storage::KvRead;
use layerdb_types::{Bytes, Hash, NodeSet};
use std::collections::BTreeMap;

/// Recomputes the trie node changes that undo one state transition.
pub trait ReverseSolver: Send + Sync {
    /// Produce the node set that turns the state at `root` back into the
    /// state at `parent_root`.
    ///
    /// `accounts` and `storages` are the flat pre-images recorded in the
    /// history entry for the transition; `db` reads the disk state currently
    /// at `root`. The returned set contains post-revert node payloads, with
    /// tombstones for nodes that only existed at `root`.
    fn apply(
        &self,
        db: &dyn KvRead,
        parent_root: Hash,
        root: Hash,
        accounts: &BTreeMap<Hash, Bytes>,
        storages: &BTreeMap<Hash, BTreeMap<Hash, Bytes>>,
    ) -> Result<NodeSet>;
}
