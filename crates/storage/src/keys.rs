//! Storage key schema.
//!
//! The whole store lives in one ordered key namespace; one-byte prefixes keep
//! the record families apart and make each family a contiguous scan range:
//!
//! | Prefix | Key | Value |
//! |---|---|---|
//! | `A` | `path` | account-trie node blob |
//! | `O` | `addr_hash ‖ path` | storage-trie node blob |
//! | `a` | `addr_hash` | flat account payload |
//! | `o` | `addr_hash ‖ slot_hash` | flat storage payload |
//! | `SID` | (singleton) | persisted state id, u64 big-endian |
//! | `SRT` | (singleton) | persisted state root, 32 bytes |
//! | `RID` | `root` | state id of a root, u64 big-endian |
//! | `J` | (singleton) | journal blob |

use layerdb_types::Hash;

/// Prefix of account-trie node keys.
pub const ACCOUNT_TRIE_PREFIX: u8 = b'A';

/// Prefix of storage-trie node keys.
pub const STORAGE_TRIE_PREFIX: u8 = b'O';

/// Prefix of flat account state keys.
pub const ACCOUNT_STATE_PREFIX: u8 = b'a';

/// Prefix of flat storage state keys.
pub const STORAGE_STATE_PREFIX: u8 = b'o';

/// Singleton key of the persisted state id.
pub const PERSISTENT_STATE_ID_KEY: &[u8] = b"SID";

/// Singleton key of the persisted state root.
pub const SNAPSHOT_ROOT_KEY: &[u8] = b"SRT";

/// Prefix of the root → state id lookup keys.
pub const STATE_ID_LOOKUP_PREFIX: &[u8] = b"RID";

/// Singleton key of the journal blob.
pub const JOURNAL_KEY: &[u8] = b"J";

/// Key of an account-trie node at `path`.
pub fn account_trie_node_key(path: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + path.len());
    key.push(ACCOUNT_TRIE_PREFIX);
    key.extend_from_slice(path);
    key
}

/// Key of a storage-trie node at `path` inside `owner`'s trie.
pub fn storage_trie_node_key(owner: &Hash, path: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Hash::BYTES + path.len());
    key.push(STORAGE_TRIE_PREFIX);
    key.extend_from_slice(owner.as_bytes());
    key.extend_from_slice(path);
    key
}

/// Key of a trie node, dispatching on the owner (zero = account trie).
pub fn trie_node_key(owner: &Hash, path: &[u8]) -> Vec<u8> {
    if owner.is_zero() {
        account_trie_node_key(path)
    } else {
        storage_trie_node_key(owner, path)
    }
}

/// Key of the flat account record for `addr_hash`.
pub fn account_state_key(addr_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Hash::BYTES);
    key.push(ACCOUNT_STATE_PREFIX);
    key.extend_from_slice(addr_hash.as_bytes());
    key
}

/// Key of the flat storage record for `(addr_hash, slot_hash)`.
pub fn storage_state_key(addr_hash: &Hash, slot_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 2 * Hash::BYTES);
    key.push(STORAGE_STATE_PREFIX);
    key.extend_from_slice(addr_hash.as_bytes());
    key.extend_from_slice(slot_hash.as_bytes());
    key
}

/// Scan prefix covering every flat account record.
pub fn account_state_prefix() -> Vec<u8> {
    vec![ACCOUNT_STATE_PREFIX]
}

/// Scan prefix covering every flat storage record of one account.
pub fn storage_state_prefix(addr_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Hash::BYTES);
    key.push(STORAGE_STATE_PREFIX);
    key.extend_from_slice(addr_hash.as_bytes());
    key
}

/// Key of the root → state id lookup for `root`.
pub fn state_id_lookup_key(root: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(STATE_ID_LOOKUP_PREFIX.len() + Hash::BYTES);
    key.extend_from_slice(STATE_ID_LOOKUP_PREFIX);
    key.extend_from_slice(root.as_bytes());
    key
}

/// Compute the exclusive end key for a prefix scan.
///
/// Returns `None` if the prefix is all `0xFF` bytes (no valid exclusive upper
/// bound). In practice this never happens with structured storage keys.
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    debug_assert!(!prefix.is_empty(), "next_prefix called with empty prefix");
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] < 255 {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trie_node_key_dispatch() {
        let owner = Hash::keccak(b"owner");
        assert_eq!(trie_node_key(&Hash::ZERO, &[0x12]), vec![b'A', 0x12]);
        assert_eq!(
            trie_node_key(&owner, &[0x12])[1..33],
            owner.as_bytes()[..]
        );
    }

    #[test]
    fn test_storage_keys_share_account_prefix() {
        let addr = Hash::keccak(b"addr");
        let slot = Hash::keccak(b"slot");
        let key = storage_state_key(&addr, &slot);
        let prefix = storage_state_prefix(&addr);
        assert!(key.starts_with(&prefix));
        assert_eq!(key.len(), 65);
    }

    #[test]
    fn test_next_prefix() {
        assert_eq!(next_prefix(&[b'a']).unwrap(), vec![b'b']);
        assert_eq!(next_prefix(&[0x01, 0xFF]).unwrap(), vec![0x02]);
        assert_eq!(next_prefix(&[0xFF, 0xFF]), None);
    }
}
