//! Per-key lookup index.
//!
//! For every key touched by a live diff layer, the index keeps the ordered
//! list (oldest → newest by insertion) of layer roots that modified it.
//! Answering "which ancestor of this head last modified K" then scans one
//! short list newest-first instead of walking the whole parent chain,
//! proving ancestry through the tree's descendants closure.

use crate::diff::DiffLayer;
use crate::error::{Error, Result};
use layerdb_types::Hash;
use std::collections::{HashMap, HashSet};

/// The tree's descendants closure: `map[A]` holds every live diff root that
/// reaches `A` by chasing parents.
pub(crate) type Descendants = HashMap<Hash, HashSet<Hash>>;

/// The resolved tip for a state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateTip {
    /// Root of the topmost ancestor that modified the key.
    pub root: Hash,
    /// The modification was a destruct without rewrite; the key reads empty.
    pub destructed: bool,
}

/// Parallel per-key indices over the live diff layers.
#[derive(Default)]
pub(crate) struct Lookup {
    destructs: HashMap<Hash, Vec<Hash>>,
    accounts: HashMap<Hash, Vec<Hash>>,
    storages: HashMap<Hash, HashMap<Hash, Vec<Hash>>>,
    nodes: HashMap<Hash, HashMap<Vec<u8>, Vec<Hash>>>,
}

/// Scan a list newest → oldest for the first root on the ancestry of `state`.
fn tip_of(list: Option<&Vec<Hash>>, state: &Hash, descendants: &Descendants) -> Option<Hash> {
    list?
        .iter()
        .rev()
        .find(|root| {
            *root == state
                || descendants
                    .get(root)
                    .is_some_and(|set| set.contains(state))
        })
        .copied()
}

impl Lookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every key the layer touches under its root.
    pub fn add_layer(&mut self, diff: &DiffLayer) {
        let root = diff.root();
        let states = &diff.states().diff;
        for addr in states.destructs() {
            self.destructs.entry(*addr).or_default().push(root);
        }
        for addr in states.accounts().keys() {
            self.accounts.entry(*addr).or_default().push(root);
        }
        for (addr, slots) in states.storages() {
            let by_slot = self.storages.entry(*addr).or_default();
            for slot in slots.keys() {
                by_slot.entry(*slot).or_default().push(root);
            }
        }
        for (owner, subset) in diff.nodes().owners() {
            let by_path = self.nodes.entry(*owner).or_default();
            for path in subset.keys() {
                by_path.entry(path.clone()).or_default().push(root);
            }
        }
    }

    /// Drop every index entry pointing at the layer's root.
    ///
    /// A missing entry means the index and the tree disagree, which is an
    /// invariant violation.
    pub fn remove_layer(&mut self, diff: &DiffLayer) -> Result<()> {
        let root = diff.root();
        let states = &diff.states().diff;
        for addr in states.destructs() {
            remove_entry(&mut self.destructs, addr, &root)?;
        }
        for addr in states.accounts().keys() {
            remove_entry(&mut self.accounts, addr, &root)?;
        }
        for (addr, slots) in states.storages() {
            if let Some(by_slot) = self.storages.get_mut(addr) {
                for slot in slots.keys() {
                    remove_entry(by_slot, slot, &root)?;
                }
                if by_slot.is_empty() {
                    self.storages.remove(addr);
                }
            } else {
                return Err(missing(&root));
            }
        }
        for (owner, subset) in diff.nodes().owners() {
            if let Some(by_path) = self.nodes.get_mut(owner) {
                for path in subset.keys() {
                    remove_entry(by_path, path, &root)?;
                }
                if by_path.is_empty() {
                    self.nodes.remove(owner);
                }
            } else {
                return Err(missing(&root));
            }
        }
        Ok(())
    }

    /// Topmost ancestor of `state` that modified the account, merging the
    /// destruct and account-write indices.
    pub fn account_tip(
        &self,
        addr_hash: &Hash,
        state: &Hash,
        descendants: &Descendants,
    ) -> Option<StateTip> {
        let write = tip_of(self.accounts.get(addr_hash), state, descendants);
        let destruct = tip_of(self.destructs.get(addr_hash), state, descendants);
        merge_tips(write, destruct, descendants)
    }

    /// Topmost ancestor of `state` that modified the storage slot, merging
    /// the destruct and slot-write indices.
    pub fn storage_tip(
        &self,
        addr_hash: &Hash,
        slot_hash: &Hash,
        state: &Hash,
        descendants: &Descendants,
    ) -> Option<StateTip> {
        let write = tip_of(
            self.storages.get(addr_hash).and_then(|s| s.get(slot_hash)),
            state,
            descendants,
        );
        let destruct = tip_of(self.destructs.get(addr_hash), state, descendants);
        merge_tips(write, destruct, descendants)
    }

    /// Topmost ancestor of `state` that modified the trie node.
    pub fn node_tip(
        &self,
        owner: &Hash,
        path: &[u8],
        state: &Hash,
        descendants: &Descendants,
    ) -> Option<Hash> {
        tip_of(
            self.nodes.get(owner).and_then(|s| s.get(path)),
            state,
            descendants,
        )
    }
}

/// Pick the newer of a write tip and a destruct tip along one ancestry path.
///
/// Equal roots mean destruct-then-rewrite within one layer, where the write
/// wins; otherwise the one descending from the other is newer.
fn merge_tips(
    write: Option<Hash>,
    destruct: Option<Hash>,
    descendants: &Descendants,
) -> Option<StateTip> {
    match (write, destruct) {
        (None, None) => None,
        (Some(w), None) => Some(StateTip {
            root: w,
            destructed: false,
        }),
        (None, Some(d)) => Some(StateTip {
            root: d,
            destructed: true,
        }),
        (Some(w), Some(d)) => {
            let write_newer = w == d
                || descendants
                    .get(&d)
                    .is_some_and(|set| set.contains(&w));
            if write_newer {
                Some(StateTip {
                    root: w,
                    destructed: false,
                })
            } else {
                Some(StateTip {
                    root: d,
                    destructed: true,
                })
            }
        }
    }
}

fn missing(root: &Hash) -> Error {
    Error::CorruptedIndex(format!("lookup entry missing for layer {root}"))
}

fn remove_entry<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<Hash>>,
    key: &K,
    root: &Hash,
) -> Result<()> {
    let list = map.get_mut(key).ok_or_else(|| missing(root))?;
    let pos = list
        .iter()
        .position(|r| r == root)
        .ok_or_else(|| missing(root))?;
    list.remove(pos);
    if list.is_empty() {
        map.remove(key);
    }
    Ok(())
}
