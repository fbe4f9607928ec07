//! # In-memory storage
//!
//! Storage backend for deterministic tests and simulation.
//!
//! Uses `im::OrdMap` for O(1) structural-sharing clones, so snapshots are a
//! single pointer copy instead of a full dataset copy. Batches apply under
//! one write lock, giving the same all-or-nothing visibility the production
//! backend gets from RocksDB's write batches.

use im::OrdMap;
use layerdb_storage::{AppendLog, BatchOp, KvRead, KvStore, StoreError, WriteBatch};
use std::sync::{Mutex, RwLock};

/// In-memory ordered key-value store.
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<OrdMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scan(
    map: &OrdMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
    start: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(start.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl KvRead for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    fn iter_from(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        // Cloning the OrdMap is O(1); the scan walks the shared structure.
        let map = self.map.read().unwrap().clone();
        Box::new(scan(&map, prefix, start).into_iter())
    }
}

impl KvStore for MemoryKv {
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write().unwrap();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Box<dyn KvRead + '_> {
        Box::new(MemorySnapshot {
            map: self.map.read().unwrap().clone(),
        })
    }
}

/// Point-in-time view of a [`MemoryKv`].
pub struct MemorySnapshot {
    map: OrdMap<Vec<u8>, Vec<u8>>,
}

impl KvRead for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.get(key).cloned())
    }

    fn iter_from(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        Box::new(scan(&self.map, prefix, start).into_iter())
    }
}

struct LogInner {
    /// Retained entries; `entries[i]` holds id `tail + 1 + i`.
    entries: Vec<Vec<u8>>,
    tail: u64,
}

/// In-memory append log.
pub struct MemoryLog {
    inner: Mutex<LogInner>,
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                entries: Vec::new(),
                tail: 0,
            }),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AppendLog for MemoryLog {
    fn head(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tail + inner.entries.len() as u64)
    }

    fn tail(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().tail)
    }

    fn append(&self, id: u64, blob: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.tail + inner.entries.len() as u64;
        if id != head + 1 {
            return Err(StoreError::GappedAppend {
                expected: head + 1,
                got: id,
            });
        }
        inner.entries.push(blob.to_vec());
        Ok(())
    }

    fn get(&self, id: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let head = inner.tail + inner.entries.len() as u64;
        if id <= inner.tail || id > head {
            return Ok(None);
        }
        Ok(Some(inner.entries[(id - inner.tail - 1) as usize].clone()))
    }

    fn truncate_head(&self, new_head: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.tail + inner.entries.len() as u64;
        if new_head < head {
            let keep = new_head.saturating_sub(inner.tail) as usize;
            inner.entries.truncate(keep);
        }
        let tail = inner.tail;
        Ok(tail + inner.entries.len() as u64)
    }

    fn truncate_tail(&self, new_tail: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.tail + inner.entries.len() as u64;
        if new_tail > inner.tail {
            let clamped = new_tail.min(head);
            let drop = (clamped - inner.tail) as usize;
            inner.entries.drain(..drop);
            inner.tail = clamped;
        }
        Ok(inner.tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_batch_and_scan() {
        let kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a1".to_vec(), b"v1".to_vec());
        batch.put(b"a2".to_vec(), b"v2".to_vec());
        batch.put(b"b1".to_vec(), b"v3".to_vec());
        kv.write(batch).unwrap();

        assert_eq!(kv.get(b"a2").unwrap().unwrap(), b"v2");
        let scanned: Vec<_> = kv.iter_from(b"a", b"a").collect();
        assert_eq!(scanned.len(), 2);
        let from_mid: Vec<_> = kv.iter_from(b"a", b"a2").collect();
        assert_eq!(from_mid, vec![(b"a2".to_vec(), b"v2".to_vec())]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"old".to_vec());
        kv.write(batch).unwrap();

        let snap = kv.snapshot();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"new".to_vec());
        kv.write(batch).unwrap();

        assert_eq!(snap.get(b"k").unwrap().unwrap(), b"old");
        assert_eq!(kv.get(b"k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_log_contiguity() {
        let log = MemoryLog::new();
        log.append(1, b"one").unwrap();
        log.append(2, b"two").unwrap();
        assert!(matches!(
            log.append(4, b"four"),
            Err(StoreError::GappedAppend { expected: 3, got: 4 })
        ));
        assert_eq!(log.head().unwrap(), 2);
        assert_eq!(log.get(2).unwrap().unwrap(), b"two");
        assert_eq!(log.get(3).unwrap(), None);
    }

    #[test]
    fn test_log_truncation() {
        let log = MemoryLog::new();
        for id in 1..=5 {
            log.append(id, &[id as u8]).unwrap();
        }

        assert_eq!(log.truncate_tail(2).unwrap(), 2);
        assert_eq!(log.get(2).unwrap(), None);
        assert_eq!(log.get(3).unwrap().unwrap(), vec![3]);

        assert_eq!(log.truncate_head(4).unwrap(), 4);
        assert_eq!(log.get(5).unwrap(), None);
        assert_eq!(log.get(4).unwrap().unwrap(), vec![4]);

        // Appends continue from the truncated head.
        log.append(5, b"five").unwrap();
        assert_eq!(log.head().unwrap(), 5);
    }
}
