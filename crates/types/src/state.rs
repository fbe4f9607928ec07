//! Flat state diffs: dirty accounts, dirty storage slots and destructed
//! accounts produced by block execution.

use crate::codec::{self, DecodeError};
use crate::Hash;
use bytes::{Buf, BufMut, Bytes};
use std::collections::{HashMap, HashSet};

/// Fixed bookkeeping cost charged per state entry.
const STATE_OVERHEAD: u64 = 32;

/// The flat state changes of one or more consecutive transitions.
///
/// Accounts and slots are keyed by their hashes. An empty payload is a
/// deletion marker and is kept in the maps so that a flush emits the matching
/// delete. A destruct wipes the account and every storage slot it owned; a
/// destructed account may be recreated within the same diff (the destruct
/// applies first, then the diff's own writes).
#[derive(Debug, Clone, Default)]
pub struct StateDiff {
    destructs: HashSet<Hash>,
    accounts: HashMap<Hash, Bytes>,
    storages: HashMap<Hash, HashMap<Hash, Bytes>>,
    size: u64,
}

impl StateDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a diff from raw parts.
    pub fn from_parts(
        destructs: HashSet<Hash>,
        accounts: HashMap<Hash, Bytes>,
        storages: HashMap<Hash, HashMap<Hash, Bytes>>,
    ) -> Self {
        let mut size = destructs.len() as u64 * (Hash::BYTES as u64 + STATE_OVERHEAD);
        for blob in accounts.values() {
            size += Hash::BYTES as u64 + blob.len() as u64 + STATE_OVERHEAD;
        }
        for slots in storages.values() {
            for blob in slots.values() {
                size += 2 * Hash::BYTES as u64 + blob.len() as u64 + STATE_OVERHEAD;
            }
        }
        Self {
            destructs,
            accounts,
            storages,
            size,
        }
    }

    /// The account payload at `addr_hash`, if this diff says anything about it.
    ///
    /// `Some(empty)` means the account is deleted here (explicitly or by a
    /// destruct without rewrite); `None` means the diff is silent and the
    /// caller must look further down.
    pub fn account(&self, addr_hash: &Hash) -> Option<Bytes> {
        if let Some(blob) = self.accounts.get(addr_hash) {
            return Some(blob.clone());
        }
        if self.destructs.contains(addr_hash) {
            return Some(Bytes::new());
        }
        None
    }

    /// The storage payload at `(addr_hash, slot_hash)`, if known to this diff.
    ///
    /// A destruct answers `Some(empty)` for every slot it does not rewrite.
    pub fn storage(&self, addr_hash: &Hash, slot_hash: &Hash) -> Option<Bytes> {
        if let Some(blob) = self.storages.get(addr_hash).and_then(|s| s.get(slot_hash)) {
            return Some(blob.clone());
        }
        if self.destructs.contains(addr_hash) {
            return Some(Bytes::new());
        }
        None
    }

    /// Whether this diff destructs the given account.
    pub fn is_destructed(&self, addr_hash: &Hash) -> bool {
        self.destructs.contains(addr_hash)
    }

    /// Destructed accounts.
    pub fn destructs(&self) -> &HashSet<Hash> {
        &self.destructs
    }

    /// Dirty accounts.
    pub fn accounts(&self) -> &HashMap<Hash, Bytes> {
        &self.accounts
    }

    /// Dirty storage slots per account.
    pub fn storages(&self) -> &HashMap<Hash, HashMap<Hash, Bytes>> {
        &self.storages
    }

    /// Merge a newer diff into this one, last-writer-wins.
    ///
    /// A destruct in `newer` supersedes every earlier buffered write to the
    /// same account: those entries are dropped before the newer writes land.
    pub fn merge(&mut self, newer: StateDiff) {
        for addr in newer.destructs {
            self.insert_destruct(addr);
        }
        for (addr, blob) in newer.accounts {
            self.insert_account(addr, blob);
        }
        for (addr, slots) in newer.storages {
            for (slot, blob) in slots {
                self.insert_storage(addr, slot, blob);
            }
        }
    }

    /// Mark an account destructed, dropping any earlier writes to it held in
    /// this diff.
    pub fn insert_destruct(&mut self, addr_hash: Hash) {
        if let Some(blob) = self.accounts.remove(&addr_hash) {
            self.size -= Hash::BYTES as u64 + blob.len() as u64 + STATE_OVERHEAD;
        }
        if let Some(slots) = self.storages.remove(&addr_hash) {
            for blob in slots.values() {
                self.size -= 2 * Hash::BYTES as u64 + blob.len() as u64 + STATE_OVERHEAD;
            }
        }
        if self.destructs.insert(addr_hash) {
            self.size += Hash::BYTES as u64 + STATE_OVERHEAD;
        }
    }

    /// Set an account payload (empty = deletion marker).
    pub fn insert_account(&mut self, addr_hash: Hash, blob: Bytes) {
        match self.accounts.get_mut(&addr_hash) {
            Some(prev) => {
                self.size = self.size + blob.len() as u64 - prev.len() as u64;
                *prev = blob;
            }
            None => {
                self.size += Hash::BYTES as u64 + blob.len() as u64 + STATE_OVERHEAD;
                self.accounts.insert(addr_hash, blob);
            }
        }
    }

    /// Set a storage payload (empty = deletion marker).
    pub fn insert_storage(&mut self, addr_hash: Hash, slot_hash: Hash, blob: Bytes) {
        let slots = self.storages.entry(addr_hash).or_default();
        match slots.get_mut(&slot_hash) {
            Some(prev) => {
                self.size = self.size + blob.len() as u64 - prev.len() as u64;
                *prev = blob;
            }
            None => {
                self.size += 2 * Hash::BYTES as u64 + blob.len() as u64 + STATE_OVERHEAD;
                slots.insert(slot_hash, blob);
            }
        }
    }

    /// Restore pre-images over this diff, undoing its newest transition.
    ///
    /// Destruct flags are deliberately kept: the restored slot pre-images
    /// cover every slot that existed below the destruct, so reads and the
    /// next flush still resolve to the reverted state.
    pub fn apply_origin(
        &mut self,
        accounts: HashMap<Hash, Bytes>,
        storages: HashMap<Hash, HashMap<Hash, Bytes>>,
    ) {
        for (addr, blob) in accounts {
            self.insert_account(addr, blob);
        }
        for (addr, slots) in storages {
            for (slot, blob) in slots {
                self.insert_storage(addr, slot, blob);
            }
        }
    }

    /// Number of dirty entries (accounts + slots + destructs).
    pub fn len(&self) -> usize {
        self.destructs.len()
            + self.accounts.len()
            + self.storages.values().map(|s| s.len()).sum::<usize>()
    }

    /// Whether the diff carries no changes.
    pub fn is_empty(&self) -> bool {
        self.destructs.is_empty() && self.accounts.is_empty() && self.storages.is_empty()
    }

    /// Approximate in-memory footprint in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.destructs.clear();
        self.accounts.clear();
        self.storages.clear();
        self.size = 0;
    }

    /// Serialize into `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.destructs.len() as u32);
        for addr in &self.destructs {
            buf.put_slice(addr.as_bytes());
        }
        buf.put_u32(self.accounts.len() as u32);
        for (addr, blob) in &self.accounts {
            buf.put_slice(addr.as_bytes());
            buf.put_u32(blob.len() as u32);
            buf.put_slice(blob);
        }
        buf.put_u32(self.storages.len() as u32);
        for (addr, slots) in &self.storages {
            buf.put_slice(addr.as_bytes());
            buf.put_u32(slots.len() as u32);
            for (slot, blob) in slots {
                buf.put_slice(slot.as_bytes());
                buf.put_u32(blob.len() as u32);
                buf.put_slice(blob);
            }
        }
    }

    /// Decode a diff previously written by [`encode_into`](Self::encode_into).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let mut destructs = HashSet::new();
        for _ in 0..codec::get_u32(buf)? {
            destructs.insert(codec::get_hash(buf)?);
        }
        let mut accounts = HashMap::new();
        for _ in 0..codec::get_u32(buf)? {
            let addr = codec::get_hash(buf)?;
            let len = codec::get_u32(buf)? as usize;
            accounts.insert(addr, codec::get_blob(buf, len)?);
        }
        let mut storages: HashMap<Hash, HashMap<Hash, Bytes>> = HashMap::new();
        for _ in 0..codec::get_u32(buf)? {
            let addr = codec::get_hash(buf)?;
            let slots = storages.entry(addr).or_default();
            for _ in 0..codec::get_u32(buf)? {
                let slot = codec::get_hash(buf)?;
                let len = codec::get_u32(buf)? as usize;
                slots.insert(slot, codec::get_blob(buf, len)?);
            }
        }
        Ok(Self::from_parts(destructs, accounts, storages))
    }
}

/// A [`StateDiff`] together with the pre-images of everything it touched.
///
/// The origins are what the reverse-diff history is built from: for every
/// dirty account and slot (and every slot wiped by a destruct) they record
/// the payload as it was before the transition, empty if it did not exist.
#[derive(Debug, Clone, Default)]
pub struct StateSet {
    /// The forward changes.
    pub diff: StateDiff,
    /// Account payloads before the transition.
    pub account_origin: HashMap<Hash, Bytes>,
    /// Storage payloads before the transition.
    pub storage_origin: HashMap<Hash, HashMap<Hash, Bytes>>,
}

impl StateSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle a diff with its origins.
    pub fn with_origin(
        diff: StateDiff,
        account_origin: HashMap<Hash, Bytes>,
        storage_origin: HashMap<Hash, HashMap<Hash, Bytes>>,
    ) -> Self {
        Self {
            diff,
            account_origin,
            storage_origin,
        }
    }

    /// Approximate in-memory footprint in bytes, origins included.
    pub fn size(&self) -> u64 {
        let mut size = self.diff.size();
        for blob in self.account_origin.values() {
            size += Hash::BYTES as u64 + blob.len() as u64;
        }
        for slots in self.storage_origin.values() {
            for blob in slots.values() {
                size += 2 * Hash::BYTES as u64 + blob.len() as u64;
            }
        }
        size
    }

    /// Serialize into `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        self.diff.encode_into(buf);
        buf.put_u32(self.account_origin.len() as u32);
        for (addr, blob) in &self.account_origin {
            buf.put_slice(addr.as_bytes());
            buf.put_u32(blob.len() as u32);
            buf.put_slice(blob);
        }
        buf.put_u32(self.storage_origin.len() as u32);
        for (addr, slots) in &self.storage_origin {
            buf.put_slice(addr.as_bytes());
            buf.put_u32(slots.len() as u32);
            for (slot, blob) in slots {
                buf.put_slice(slot.as_bytes());
                buf.put_u32(blob.len() as u32);
                buf.put_slice(blob);
            }
        }
    }

    /// Decode a set previously written by [`encode_into`](Self::encode_into).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let diff = StateDiff::decode(buf)?;
        let mut account_origin = HashMap::new();
        for _ in 0..codec::get_u32(buf)? {
            let addr = codec::get_hash(buf)?;
            let len = codec::get_u32(buf)? as usize;
            account_origin.insert(addr, codec::get_blob(buf, len)?);
        }
        let mut storage_origin: HashMap<Hash, HashMap<Hash, Bytes>> = HashMap::new();
        for _ in 0..codec::get_u32(buf)? {
            let addr = codec::get_hash(buf)?;
            let slots = storage_origin.entry(addr).or_default();
            for _ in 0..codec::get_u32(buf)? {
                let slot = codec::get_hash(buf)?;
                let len = codec::get_u32(buf)? as usize;
                slots.insert(slot, codec::get_blob(buf, len)?);
            }
        }
        Ok(Self {
            diff,
            account_origin,
            storage_origin,
        })
    }
}
