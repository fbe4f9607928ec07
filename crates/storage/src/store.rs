//! The key-value store and append log contracts.
//!
//! These traits are the full persistence surface of the state store. The
//! engine never touches files or database handles directly; everything goes
//! through a [`KvStore`] (point reads, ordered scans, atomic batches,
//! snapshots) and an [`AppendLog`] (the reverse-diff freezer).

use crate::{StoreError, WriteBatch};

/// Read-only access to an ordered key-value namespace.
///
/// Implemented both by live stores and by point-in-time snapshots.
pub trait KvRead: Send + Sync {
    /// Fetch the value stored at `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Iterate entries whose key starts with `prefix`, beginning at the first
    /// key `>= start`, in ascending key order.
    ///
    /// `start` is the full key to seek to, not a suffix; passing `prefix`
    /// itself scans the whole prefix range.
    fn iter_from(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>;
}

/// A writable key-value store with atomic batches and snapshots.
pub trait KvStore: KvRead {
    /// Apply a batch atomically.
    ///
    /// The batch is all-or-nothing: no reader (and no reopen after a crash)
    /// may observe a strict subset of it.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Take a point-in-time snapshot for isolated reads.
    ///
    /// Writes applied after the snapshot is taken are invisible through it.
    fn snapshot(&self) -> Box<dyn KvRead + '_>;
}

/// An append-only log of binary entries with head and tail truncation.
///
/// Entries carry contiguous 1-based ids: the retained range is
/// `(tail, head]`, where `head` is the id of the newest entry (0 when the
/// log is empty) and `tail` counts entries pruned from the oldest end
/// (0 when nothing was pruned). Appends must use id `head + 1`.
pub trait AppendLog: Send + Sync {
    /// Id of the newest entry, 0 if none was ever written (or all were
    /// head-truncated away).
    fn head(&self) -> Result<u64, StoreError>;

    /// Number of entries pruned from the tail; the oldest retained entry has
    /// id `tail + 1`.
    fn tail(&self) -> Result<u64, StoreError>;

    /// Append an entry at `id`.
    ///
    /// Fails with [`StoreError::GappedAppend`] unless `id == head + 1`.
    fn append(&self, id: u64, blob: &[u8]) -> Result<(), StoreError>;

    /// Read the entry at `id`; `None` if it is outside the retained range.
    fn get(&self, id: u64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Drop all entries with id greater than `new_head`; returns the new head.
    ///
    /// A `new_head` at or above the current head is a no-op.
    fn truncate_head(&self, new_head: u64) -> Result<u64, StoreError>;

    /// Drop all entries with id at or below `new_tail`; returns the new tail.
    ///
    /// A `new_tail` at or below the current tail is a no-op.
    fn truncate_tail(&self, new_tail: u64) -> Result<u64, StoreError>;
}
