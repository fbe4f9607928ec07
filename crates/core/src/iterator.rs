//! Merged ordered iteration over accounts and storage.
//!
//! Produces a strictly-increasing-by-hash stream over the combined view of a
//! head layer, its ancestors, the aggregation buffer and the persisted flat
//! state. An explicit priority-queue state machine ordered by
//! `(hash, depth)` merges the per-layer streams: the lowest depth (newest
//! layer) wins ties, older positions at the same hash are skipped, and
//! tombstones are dropped. `seek` restarts the stream at an arbitrary hash.

use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::tree::LayerTree;
use layerdb_storage::{keys, KvRead, KvStore};
use layerdb_types::{Bytes, Hash, StateDiff};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

/// Entries pulled from the store per refill of a disk sub-iterator.
const DISK_CHUNK: usize = 128;

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    hash: Hash,
    /// Also the sub-iterator index: subs are stacked newest-first.
    depth: usize,
}

/// One sorted source feeding the merge.
enum SubIter {
    /// A sorted snapshot of one layer's (or the buffer's) local map.
    Mem {
        entries: Vec<(Hash, Bytes)>,
        pos: usize,
    },
    /// A chunked range scan over the persisted flat state.
    Disk {
        prefix: Vec<u8>,
        /// Offset of the 32-byte hash inside the full storage key.
        hash_offset: usize,
        next_start: Vec<u8>,
        buffered: VecDeque<(Hash, Bytes)>,
        exhausted: bool,
    },
}

impl SubIter {
    fn mem(mut entries: Vec<(Hash, Bytes)>) -> Self {
        entries.sort_by_key(|(hash, _)| *hash);
        SubIter::Mem { entries, pos: 0 }
    }

    fn disk(prefix: Vec<u8>) -> Self {
        SubIter::Disk {
            next_start: prefix.clone(),
            hash_offset: prefix.len(),
            prefix,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    fn next(&mut self, snapshot: &dyn KvRead) -> Option<(Hash, Bytes)> {
        match self {
            SubIter::Mem { entries, pos } => {
                let item = entries.get(*pos).cloned();
                if item.is_some() {
                    *pos += 1;
                }
                item
            }
            SubIter::Disk {
                prefix,
                hash_offset,
                next_start,
                buffered,
                exhausted,
            } => {
                if buffered.is_empty() && !*exhausted {
                    let mut pulled = 0;
                    for (key, value) in snapshot.iter_from(prefix, next_start).take(DISK_CHUNK) {
                        let hash = Hash::from_hash_bytes(&key[*hash_offset..*hash_offset + 32]);
                        buffered.push_back((hash, Bytes::from(value)));
                        *next_start = key;
                        next_start.push(0);
                        pulled += 1;
                    }
                    if pulled < DISK_CHUNK {
                        *exhausted = true;
                    }
                }
                buffered.pop_front()
            }
        }
    }

    fn seek(&mut self, target: &Hash) {
        match self {
            SubIter::Mem { entries, pos } => {
                *pos = entries.partition_point(|(hash, _)| hash < target);
            }
            SubIter::Disk {
                prefix,
                next_start,
                buffered,
                exhausted,
                ..
            } => {
                let mut start = prefix.clone();
                start.extend_from_slice(target.as_bytes());
                *next_start = start;
                buffered.clear();
                *exhausted = false;
            }
        }
    }
}

/// Merged, seekable iterator over one state dimension (accounts, or the
/// storage of one account) at a given head layer.
pub struct MergedIterator<'a> {
    snapshot: Box<dyn KvRead + 'a>,
    subs: Vec<SubIter>,
    heads: Vec<Option<(Hash, Bytes)>>,
    heap: BinaryHeap<Reverse<HeapKey>>,
}

impl<'a> MergedIterator<'a> {
    fn assemble(snapshot: Box<dyn KvRead + 'a>, mut subs: Vec<SubIter>, seek: &Hash) -> Self {
        for sub in &mut subs {
            sub.seek(seek);
        }
        let mut iter = Self {
            heads: Vec::with_capacity(subs.len()),
            heap: BinaryHeap::with_capacity(subs.len()),
            snapshot,
            subs,
        };
        for depth in 0..iter.subs.len() {
            iter.heads.push(None);
            iter.pull(depth);
        }
        iter
    }

    /// Advance sub-iterator `depth` and refresh its heap entry.
    fn pull(&mut self, depth: usize) {
        let item = self.subs[depth].next(self.snapshot.as_ref());
        if let Some((hash, _)) = &item {
            self.heap.push(Reverse(HeapKey { hash: *hash, depth }));
        }
        self.heads[depth] = item;
    }

    /// Restart the stream at the first hash `>= target`.
    pub fn seek(&mut self, target: Hash) {
        self.heap.clear();
        for sub in &mut self.subs {
            sub.seek(&target);
        }
        for depth in 0..self.subs.len() {
            self.pull(depth);
        }
    }
}

impl Iterator for MergedIterator<'_> {
    type Item = (Hash, Bytes);

    fn next(&mut self) -> Option<(Hash, Bytes)> {
        loop {
            let Reverse(top) = self.heap.pop()?;
            let (hash, value) = self.heads[top.depth]
                .take()
                .expect("heap entry without a buffered head");
            self.pull(top.depth);

            // Everything older positioned at the same hash is shadowed.
            while let Some(Reverse(peek)) = self.heap.peek() {
                if peek.hash != hash {
                    break;
                }
                let Reverse(dup) = self.heap.pop().expect("peeked entry vanished");
                self.heads[dup.depth].take();
                self.pull(dup.depth);
            }

            if value.is_empty() {
                continue; // tombstone
            }
            return Some((hash, value));
        }
    }
}

/// Sorted account entries of one state diff, destructs included as
/// tombstones (unless rewritten in the same diff).
fn account_entries(states: &StateDiff) -> Vec<(Hash, Bytes)> {
    let mut entries: Vec<(Hash, Bytes)> = states
        .accounts()
        .iter()
        .map(|(addr, blob)| (*addr, blob.clone()))
        .collect();
    for addr in states.destructs() {
        if !states.accounts().contains_key(addr) {
            entries.push((*addr, Bytes::new()));
        }
    }
    entries
}

/// Sorted storage entries of one account in one state diff. Returns the
/// entries plus whether this diff destructs the account (a barrier: nothing
/// below it may contribute).
fn storage_entries(states: &StateDiff, account: &Hash) -> (Vec<(Hash, Bytes)>, bool) {
    let entries = states
        .storages()
        .get(account)
        .map(|slots| slots.iter().map(|(slot, blob)| (*slot, blob.clone())).collect())
        .unwrap_or_default();
    (entries, states.is_destructed(account))
}

/// Build the merged account iterator for `state`.
pub(crate) fn account_iterator<'a>(
    tree: &LayerTree,
    kv: &'a dyn KvStore,
    generation_done: bool,
    state: Hash,
    seek: Hash,
) -> Result<MergedIterator<'a>> {
    if !generation_done {
        return Err(Error::NotCoveredYet);
    }
    let stack = stack_layers(tree, state, |states| (account_entries(states), false))?;
    let mut subs = stack.subs;
    subs.push(SubIter::disk(keys::account_state_prefix()));
    Ok(MergedIterator::assemble(kv.snapshot(), subs, &seek))
}

/// Build the merged storage iterator of `account` for `state`.
pub(crate) fn storage_iterator<'a>(
    tree: &LayerTree,
    kv: &'a dyn KvStore,
    generation_done: bool,
    state: Hash,
    account: Hash,
    seek: Hash,
) -> Result<MergedIterator<'a>> {
    if !generation_done {
        return Err(Error::NotCoveredYet);
    }
    let stack = stack_layers(tree, state, |states| storage_entries(states, &account))?;
    let mut subs = stack.subs;
    // A destruct anywhere in the stack hides everything below it, the
    // persisted records included.
    if !stack.barrier {
        subs.push(SubIter::disk(keys::storage_state_prefix(&account)));
    }
    Ok(MergedIterator::assemble(kv.snapshot(), subs, &seek))
}

struct LayerStack {
    subs: Vec<SubIter>,
    /// A destruct cut the stack before the persisted records.
    barrier: bool,
}

/// Walk `state`'s chain head-down, collecting one Mem sub per diff layer and
/// one for the buffer. The extractor returns (entries, barrier): a barrier
/// stops the walk after the current source.
fn stack_layers<F>(tree: &LayerTree, state: Hash, mut extract: F) -> Result<LayerStack>
where
    F: FnMut(&StateDiff) -> (Vec<(Hash, Bytes)>, bool),
{
    let mut subs = Vec::new();
    let mut layer = tree.get(&state).ok_or(Error::Stale)?;
    loop {
        match layer {
            Layer::Diff(diff) => {
                if diff.is_stale() {
                    return Err(Error::Stale);
                }
                let (entries, barrier) = extract(&diff.states().diff);
                subs.push(SubIter::mem(entries));
                if barrier {
                    return Ok(LayerStack {
                        subs,
                        barrier: true,
                    });
                }
                layer = diff.parent_layer();
            }
            Layer::Disk(disk) => {
                if disk.is_stale() {
                    return Err(Error::Stale);
                }
                let buffer = disk.buffer().read().unwrap();
                let (entries, barrier) = extract(buffer.states());
                drop(buffer);
                subs.push(SubIter::mem(entries));
                return Ok(LayerStack { subs, barrier });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_subiter_sorts_and_seeks() {
        let mut sub = SubIter::mem(vec![
            (Hash::from([3u8; 32]), Bytes::from_static(b"c")),
            (Hash::from([1u8; 32]), Bytes::from_static(b"a")),
            (Hash::from([2u8; 32]), Bytes::from_static(b"b")),
        ]);
        let snapshot = NoopRead;
        assert_eq!(sub.next(&snapshot).unwrap().1.as_ref(), b"a");

        sub.seek(&Hash::from([2u8; 32]));
        assert_eq!(sub.next(&snapshot).unwrap().1.as_ref(), b"b");
        assert_eq!(sub.next(&snapshot).unwrap().1.as_ref(), b"c");
        assert!(sub.next(&snapshot).is_none());
    }

    struct NoopRead;

    impl KvRead for NoopRead {
        fn get(&self, _key: &[u8]) -> std::result::Result<Option<Vec<u8>>, layerdb_storage::StoreError> {
            Ok(None)
        }

        fn iter_from(
            &self,
            _prefix: &[u8],
            _start: &[u8],
        ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
            Box::new(std::iter::empty())
        }
    }
}
