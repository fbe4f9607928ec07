//! Reverse-diff history.
//!
//! Every committed transition appends one entry to the freezer: the flat
//! pre-images of everything the transition touched, keyed by the transition's
//! state id. Entries let the disk layer step back one block at a time
//! (bounded by the retention limit) and let startup reconcile the freezer
//! with whatever state actually reached disk.
//!
//! Wire layout (version 1):
//!
//! ```text
//! version(u8) ‖ parent_root(32) ‖ root(32) ‖ len(u32) ‖ entries
//! entries := repeated key_len(u16) ‖ key ‖ val_len(u32) ‖ val
//! ```
//!
//! Account keys are the 32-byte hashed address; storage keys are the 64-byte
//! hashed address ‖ hashed slot. Values are pre-images, empty when the record
//! did not exist before the transition.

use crate::context::StoreContext;
use crate::diff::DiffLayer;
use crate::error::{Error, Result};
use bytes::BufMut;
use layerdb_storage::{schema, AppendLog, KvStore, WriteBatch};
use layerdb_types::{codec, Bytes, Hash};
use std::collections::BTreeMap;
use std::time::Instant;

/// Version tag of the reverse diff layout this implementation writes.
///
/// Anything else fails decoding; the repair path then truncates it away.
const HISTORY_VERSION: u8 = 1;

/// The reverse diff of one state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// State root of the parent block.
    pub parent_root: Hash,
    /// State root the recorded transition produced.
    pub root: Hash,
    /// Account pre-images; empty bytes mean "did not exist".
    pub accounts: BTreeMap<Hash, Bytes>,
    /// Storage pre-images; for destructed accounts this covers every slot
    /// the account owned.
    pub storages: BTreeMap<Hash, BTreeMap<Hash, Bytes>>,
}

impl HistoryEntry {
    /// Build the reverse diff for a diff layer about to be committed.
    pub(crate) fn from_diff(bottom: &DiffLayer) -> Self {
        let states = bottom.states();
        let accounts = states
            .account_origin
            .iter()
            .map(|(addr, blob)| (*addr, blob.clone()))
            .collect();
        let storages = states
            .storage_origin
            .iter()
            .map(|(addr, slots)| {
                (
                    *addr,
                    slots.iter().map(|(slot, blob)| (*slot, blob.clone())).collect(),
                )
            })
            .collect();
        Self {
            parent_root: bottom.parent_layer().root(),
            root: bottom.root(),
            accounts,
            storages,
        }
    }

    /// Serialize to the versioned wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let entries = self.accounts.len()
            + self.storages.values().map(|s| s.len()).sum::<usize>();
        let mut buf = Vec::new();
        buf.put_u8(HISTORY_VERSION);
        buf.put_slice(self.parent_root.as_bytes());
        buf.put_slice(self.root.as_bytes());
        buf.put_u32(entries as u32);
        for (addr, blob) in &self.accounts {
            buf.put_u16(Hash::BYTES as u16);
            buf.put_slice(addr.as_bytes());
            buf.put_u32(blob.len() as u32);
            buf.put_slice(blob);
        }
        for (addr, slots) in &self.storages {
            for (slot, blob) in slots {
                buf.put_u16(2 * Hash::BYTES as u16);
                buf.put_slice(addr.as_bytes());
                buf.put_slice(slot.as_bytes());
                buf.put_u32(blob.len() as u32);
                buf.put_slice(blob);
            }
        }
        buf
    }

    /// Decode an entry, rejecting unknown versions and malformed keys.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let mut buf = blob;

        let version = codec::get_u8(&mut buf)?;
        if version != HISTORY_VERSION {
            return Err(Error::CorruptedIndex(format!(
                "unsupported state history version {version}"
            )));
        }
        let parent_root = codec::get_hash(&mut buf)?;
        let root = codec::get_hash(&mut buf)?;
        let count = codec::get_u32(&mut buf)?;

        let mut accounts = BTreeMap::new();
        let mut storages: BTreeMap<Hash, BTreeMap<Hash, Bytes>> = BTreeMap::new();
        for _ in 0..count {
            let key_len = codec::get_u16(&mut buf)? as usize;
            match key_len {
                32 => {
                    let addr = codec::get_hash(&mut buf)?;
                    let val_len = codec::get_u32(&mut buf)? as usize;
                    let val = codec::get_blob(&mut buf, val_len)?;
                    accounts.insert(addr, val);
                }
                64 => {
                    let addr = codec::get_hash(&mut buf)?;
                    let slot = codec::get_hash(&mut buf)?;
                    let val_len = codec::get_u32(&mut buf)? as usize;
                    let val = codec::get_blob(&mut buf, val_len)?;
                    storages.entry(addr).or_default().insert(slot, val);
                }
                n => {
                    return Err(Error::CorruptedIndex(format!(
                        "state history key of {n} bytes"
                    )))
                }
            }
        }
        if !buf.is_empty() {
            return Err(Error::CorruptedIndex(format!(
                "state history has {} trailing bytes",
                buf.len()
            )));
        }
        Ok(Self {
            parent_root,
            root,
            accounts,
            storages,
        })
    }
}

/// Write the reverse diff for `bottom` at its state id, then prune the tail
/// if the retention limit was crossed.
pub(crate) fn write(ctx: &StoreContext, bottom: &DiffLayer) -> Result<()> {
    let start = Instant::now();
    let entry = HistoryEntry::from_diff(bottom);
    let blob = entry.encode();
    ctx.freezer.append(bottom.id(), &blob)?;
    layerdb_metrics::record_history_written(blob.len() as u64, start.elapsed().as_secs_f64());

    let limit = ctx.config.state_history_limit;
    if limit > 0 && bottom.id() > limit {
        let pruned = truncate_tail(ctx, bottom.id() - limit)?;
        if pruned > 0 {
            layerdb_metrics::record_history_pruned(pruned);
            tracing::debug!(id = bottom.id(), pruned, "pruned state history tail");
        }
    }
    Ok(())
}

/// Read and decode the entry at `id`; `None` if outside the retained range.
pub(crate) fn read(freezer: &dyn AppendLog, id: u64) -> Result<Option<HistoryEntry>> {
    match freezer.get(id)? {
        Some(blob) => Ok(Some(HistoryEntry::decode(&blob)?)),
        None => Ok(None),
    }
}

/// Drop entries from the tail up to and including `new_tail`, removing the
/// root → id lookups of everything dropped. Returns the number pruned.
pub(crate) fn truncate_tail(ctx: &StoreContext, new_tail: u64) -> Result<u64> {
    let old_tail = ctx.freezer.tail()?;
    let head = ctx.freezer.head()?;
    let new_tail = new_tail.min(head);
    if new_tail <= old_tail {
        return Ok(0);
    }
    let mut batch = WriteBatch::new();
    for id in (old_tail + 1)..=new_tail {
        // An undecodable entry simply leaves its lookup behind; the lookup is
        // validated against the freezer range on use anyway.
        if let Ok(Some(entry)) = read(ctx.freezer.as_ref(), id) {
            schema::delete_state_id(&mut batch, &entry.root);
        }
    }
    if !batch.is_empty() {
        ctx.kv.write(batch)?;
    }
    ctx.freezer.truncate_tail(new_tail)?;
    Ok(new_tail - old_tail)
}

/// Invalidate all entries with id greater than `new_head`, removing the
/// root → id lookups of everything dropped. Returns the new head.
pub(crate) fn truncate_head(ctx: &StoreContext, new_head: u64) -> Result<u64> {
    let head = ctx.freezer.head()?;
    let mut batch = WriteBatch::new();
    for id in (new_head + 1)..=head {
        if let Ok(Some(entry)) = read(ctx.freezer.as_ref(), id) {
            schema::delete_state_id(&mut batch, &entry.root);
        }
    }
    if !batch.is_empty() {
        ctx.kv.write(batch)?;
    }
    Ok(ctx.freezer.truncate_head(new_head)?)
}

/// Align the freezer with the persisted disk state on startup.
///
/// Walks from the newest entry toward the tail, dropping everything whose
/// root is ahead of `disk_root` (written but never flushed, or invalidated by
/// a crash). Returns the id of the entry matching `disk_root`, or the tail id
/// if none matches.
pub(crate) fn repair(ctx: &StoreContext, disk_root: Hash) -> Result<u64> {
    let tail = ctx.freezer.tail()?;
    let mut current = ctx.freezer.head()?;
    while current > tail {
        match read(ctx.freezer.as_ref(), current) {
            Ok(Some(entry)) if entry.root == disk_root => return Ok(current),
            Ok(entry) => {
                if let Some(entry) = entry {
                    let mut batch = WriteBatch::new();
                    schema::delete_state_id(&mut batch, &entry.root);
                    ctx.kv.write(batch)?;
                }
                tracing::warn!(id = current, "dropping state history ahead of disk");
                ctx.freezer.truncate_head(current - 1)?;
                current -= 1;
            }
            Err(_) => {
                tracing::warn!(id = current, "dropping undecodable state history");
                ctx.freezer.truncate_head(current - 1)?;
                current -= 1;
            }
        }
    }
    Ok(tail)
}
