//! Typed accessors over the raw key schema.
//!
//! Thin helpers pairing each record family with its encoding, so callers
//! never hand-build keys or parse singleton payloads. Readers take any
//! [`KvRead`]; writers queue into a [`WriteBatch`] so the caller controls
//! atomicity.

use crate::{keys, KvRead, StoreError, WriteBatch};
use layerdb_types::Hash;

/// Read the persisted state id; 0 if the store is fresh.
pub fn read_persistent_state_id(db: &dyn KvRead) -> Result<u64, StoreError> {
    match db.get(keys::PERSISTENT_STATE_ID_KEY)? {
        Some(raw) => Ok(decode_u64(&raw)?),
        None => Ok(0),
    }
}

/// Queue a write of the persisted state id.
pub fn write_persistent_state_id(batch: &mut WriteBatch, id: u64) {
    batch.put(keys::PERSISTENT_STATE_ID_KEY.to_vec(), id.to_be_bytes().to_vec());
}

/// Read the persisted state root, `None` if the store is fresh.
pub fn read_snapshot_root(db: &dyn KvRead) -> Result<Option<Hash>, StoreError> {
    match db.get(keys::SNAPSHOT_ROOT_KEY)? {
        Some(raw) if raw.len() == Hash::BYTES => Ok(Some(Hash::from_hash_bytes(&raw))),
        Some(raw) => Err(StoreError::Backend(format!(
            "snapshot root has {} bytes, want {}",
            raw.len(),
            Hash::BYTES
        ))),
        None => Ok(None),
    }
}

/// Queue a write of the persisted state root.
pub fn write_snapshot_root(batch: &mut WriteBatch, root: &Hash) {
    batch.put(keys::SNAPSHOT_ROOT_KEY.to_vec(), root.as_bytes().to_vec());
}

/// Read the state id recorded for `root`, if any.
pub fn read_state_id(db: &dyn KvRead, root: &Hash) -> Result<Option<u64>, StoreError> {
    match db.get(&keys::state_id_lookup_key(root))? {
        Some(raw) => Ok(Some(decode_u64(&raw)?)),
        None => Ok(None),
    }
}

/// Queue a write of the root → state id lookup.
pub fn write_state_id(batch: &mut WriteBatch, root: &Hash, id: u64) {
    batch.put(keys::state_id_lookup_key(root), id.to_be_bytes().to_vec());
}

/// Queue a delete of the root → state id lookup.
pub fn delete_state_id(batch: &mut WriteBatch, root: &Hash) {
    batch.delete(keys::state_id_lookup_key(root));
}

/// Read a trie node blob; `None` if absent.
pub fn read_trie_node(
    db: &dyn KvRead,
    owner: &Hash,
    path: &[u8],
) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(&keys::trie_node_key(owner, path))
}

/// Queue a write of a trie node blob.
pub fn write_trie_node(batch: &mut WriteBatch, owner: &Hash, path: &[u8], blob: &[u8]) {
    batch.put(keys::trie_node_key(owner, path), blob.to_vec());
}

/// Queue a delete of a trie node.
pub fn delete_trie_node(batch: &mut WriteBatch, owner: &Hash, path: &[u8]) {
    batch.delete(keys::trie_node_key(owner, path));
}

/// Read a flat account payload; `None` if absent.
pub fn read_account_state(db: &dyn KvRead, addr_hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(&keys::account_state_key(addr_hash))
}

/// Queue a write of a flat account payload.
pub fn write_account_state(batch: &mut WriteBatch, addr_hash: &Hash, blob: &[u8]) {
    batch.put(keys::account_state_key(addr_hash), blob.to_vec());
}

/// Queue a delete of a flat account record.
pub fn delete_account_state(batch: &mut WriteBatch, addr_hash: &Hash) {
    batch.delete(keys::account_state_key(addr_hash));
}

/// Read a flat storage payload; `None` if absent.
pub fn read_storage_state(
    db: &dyn KvRead,
    addr_hash: &Hash,
    slot_hash: &Hash,
) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(&keys::storage_state_key(addr_hash, slot_hash))
}

/// Queue a write of a flat storage payload.
pub fn write_storage_state(batch: &mut WriteBatch, addr_hash: &Hash, slot_hash: &Hash, blob: &[u8]) {
    batch.put(keys::storage_state_key(addr_hash, slot_hash), blob.to_vec());
}

/// Queue a delete of a flat storage record.
pub fn delete_storage_state(batch: &mut WriteBatch, addr_hash: &Hash, slot_hash: &Hash) {
    batch.delete(keys::storage_state_key(addr_hash, slot_hash));
}

/// Read the journal blob, if present.
pub fn read_journal(db: &dyn KvRead) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(keys::JOURNAL_KEY)
}

/// Queue a write of the journal blob.
pub fn write_journal(batch: &mut WriteBatch, blob: &[u8]) {
    batch.put(keys::JOURNAL_KEY.to_vec(), blob.to_vec());
}

/// Queue a delete of the journal blob.
pub fn delete_journal(batch: &mut WriteBatch) {
    batch.delete(keys::JOURNAL_KEY.to_vec());
}

fn decode_u64(raw: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Backend(format!("u64 record has {} bytes, want 8", raw.len())))?;
    Ok(u64::from_be_bytes(arr))
}
