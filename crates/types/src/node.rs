//! Dirty trie nodes and the per-owner node set.

use crate::codec::{self, DecodeError};
use crate::Hash;
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;

/// Fixed bookkeeping cost charged per cached node entry, on top of the path
/// and blob payload. Keeps the buffer threshold honest about map overhead.
const NODE_OVERHEAD: u64 = 32;

/// A single trie node, identified by the hash of its encoded blob.
///
/// A node with an empty blob (and zero hash) is a tombstone: the node existed
/// before and has been deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Keccak-256 of `blob`, or `Hash::ZERO` for a tombstone.
    pub hash: Hash,
    /// Encoded node payload; empty for a tombstone.
    pub blob: Bytes,
}

impl Node {
    /// Create a node from a hash and its encoded blob.
    pub fn new(hash: Hash, blob: Bytes) -> Self {
        Self { hash, blob }
    }

    /// Create a node from its blob, hashing it.
    pub fn from_blob(blob: Bytes) -> Self {
        Self {
            hash: Hash::keccak(&blob),
            blob,
        }
    }

    /// A deletion marker.
    pub fn deleted() -> Self {
        Self {
            hash: Hash::ZERO,
            blob: Bytes::new(),
        }
    }

    /// Whether this node marks a deletion.
    pub fn is_deleted(&self) -> bool {
        self.blob.is_empty()
    }

    /// Approximate in-memory footprint of the payload.
    pub fn size(&self) -> u64 {
        Hash::BYTES as u64 + self.blob.len() as u64
    }
}

/// Dirty trie nodes produced by one or more state transitions, grouped by the
/// trie they belong to.
///
/// The owner `Hash::ZERO` designates the account trie; any other owner is the
/// hashed address whose storage trie the nodes live in. Paths are unique per
/// owner. Merging is last-writer-wins per `(owner, path)`.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: HashMap<Hash, HashMap<Vec<u8>, Node>>,
    size: u64,
}

impl NodeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a raw owner → path → node mapping.
    pub fn from_nodes(nodes: HashMap<Hash, HashMap<Vec<u8>, Node>>) -> Self {
        let mut size = 0;
        for subset in nodes.values() {
            for (path, node) in subset {
                size += path.len() as u64 + node.size() + NODE_OVERHEAD;
            }
        }
        Self { nodes, size }
    }

    /// Insert a node, replacing any previous entry at the same position.
    pub fn insert(&mut self, owner: Hash, path: Vec<u8>, node: Node) {
        let subset = self.nodes.entry(owner).or_default();
        match subset.get_mut(&path) {
            Some(prev) => {
                // Same path: only the blob footprint changes.
                self.size = self.size + node.size() - prev.size();
                *prev = node;
            }
            None => {
                self.size += path.len() as u64 + node.size() + NODE_OVERHEAD;
                subset.insert(path, node);
            }
        }
    }

    /// Look up a node by owner and path.
    pub fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.get(owner)?.get(path)
    }

    /// Whether a node exists at the given position.
    pub fn contains(&self, owner: &Hash, path: &[u8]) -> bool {
        self.node(owner, path).is_some()
    }

    /// Merge `other` into `self`, overwriting nodes at the same position.
    pub fn merge(&mut self, other: NodeSet) {
        for (owner, subset) in other.nodes {
            for (path, node) in subset {
                self.insert(owner, path, node);
            }
        }
    }

    /// Iterate over all `(owner, path, node)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &Vec<u8>, &Node)> {
        self.nodes
            .iter()
            .flat_map(|(owner, subset)| subset.iter().map(move |(path, node)| (owner, path, node)))
    }

    /// Iterate over the per-owner subsets.
    pub fn owners(&self) -> impl Iterator<Item = (&Hash, &HashMap<Vec<u8>, Node>)> {
        self.nodes.iter()
    }

    /// Number of nodes across all owners.
    pub fn len(&self) -> usize {
        self.nodes.values().map(|s| s.len()).sum()
    }

    /// Whether the set holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Approximate in-memory footprint in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.size = 0;
    }

    /// Serialize into `buf`.
    ///
    /// Layout: `owner_count(u32)` then per owner `owner(32) ‖ path_count(u32)`
    /// and per path `path_len(u16) ‖ path ‖ hash(32) ‖ blob_len(u32) ‖ blob`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.nodes.len() as u32);
        for (owner, subset) in &self.nodes {
            buf.put_slice(owner.as_bytes());
            buf.put_u32(subset.len() as u32);
            for (path, node) in subset {
                buf.put_u16(path.len() as u16);
                buf.put_slice(path);
                buf.put_slice(node.hash.as_bytes());
                buf.put_u32(node.blob.len() as u32);
                buf.put_slice(&node.blob);
            }
        }
    }

    /// Decode a set previously written by [`encode_into`](Self::encode_into).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let mut set = NodeSet::new();
        let owners = codec::get_u32(buf)?;
        for _ in 0..owners {
            let owner = codec::get_hash(buf)?;
            let count = codec::get_u32(buf)?;
            for _ in 0..count {
                let path_len = codec::get_u16(buf)? as usize;
                let path = codec::get_blob(buf, path_len)?.to_vec();
                let hash = codec::get_hash(buf)?;
                let blob_len = codec::get_u32(buf)? as usize;
                let blob = codec::get_blob(buf, blob_len)?;
                set.insert(owner, path, Node::new(hash, blob));
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u8) -> Hash {
        Hash::from([n; 32])
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut set = NodeSet::new();
        set.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"root")));
        set.insert(owner(1), vec![], Node::deleted());

        assert_eq!(set.len(), 2);
        assert_eq!(set.node(&Hash::ZERO, &[0x01]).unwrap().blob.as_ref(), b"root");
        assert!(set.node(&owner(1), &[]).unwrap().is_deleted());
        assert!(set.node(&owner(2), &[]).is_none());
    }

    #[test]
    fn test_merge_overwrites_same_path() {
        let mut base = NodeSet::new();
        base.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"old")));

        let mut newer = NodeSet::new();
        newer.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"newer")));
        newer.insert(Hash::ZERO, vec![0x02], Node::deleted());

        base.merge(newer);
        assert_eq!(base.len(), 2);
        assert_eq!(base.node(&Hash::ZERO, &[0x01]).unwrap().blob.as_ref(), b"newer");
    }

    #[test]
    fn test_size_tracks_overwrites() {
        let mut set = NodeSet::new();
        set.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"aaaa")));
        let before = set.size();

        // Shrinking the blob must shrink the size, not grow it.
        set.insert(Hash::ZERO, vec![0x01], Node::from_blob(Bytes::from_static(b"a")));
        assert_eq!(set.size(), before - 3);
    }

    #[test]
    fn test_encode_decode() {
        let mut set = NodeSet::new();
        set.insert(Hash::ZERO, vec![], Node::from_blob(Bytes::from_static(b"root node")));
        set.insert(owner(7), vec![0x0a, 0x0b], Node::deleted());

        let mut buf = Vec::new();
        set.encode_into(&mut buf);
        let decoded = NodeSet::decode(&mut buf.as_slice()).unwrap();

        assert_eq!(decoded.len(), set.len());
        assert_eq!(decoded.size(), set.size());
        assert_eq!(
            decoded.node(&Hash::ZERO, &[]).unwrap().blob,
            set.node(&Hash::ZERO, &[]).unwrap().blob
        );
        assert!(decoded.node(&owner(7), &[0x0a, 0x0b]).unwrap().is_deleted());
    }
}
