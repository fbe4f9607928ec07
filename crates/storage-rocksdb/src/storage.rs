//! # RocksDB storage
//!
//! Production storage backend. All operations are synchronous blocking I/O.
//!
//! Two column families: `state` holds the key-value namespace (trie nodes,
//! flat state, metadata singletons), `history` holds the append log entries
//! plus its head/tail markers. Batches are written with `sync = true`: the
//! state store's crash-consistency argument hangs off batch atomicity, so
//! a flush must not linger in an unsynced WAL.

use layerdb_storage::{AppendLog, BatchOp, KvRead, KvStore, StoreError, WriteBatch};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteOptions, DB};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Column family holding the key-value namespace.
const STATE_CF: &str = "state";

/// Column family holding append log entries and markers.
const HISTORY_CF: &str = "history";

/// Marker key of the newest entry id.
const HEAD_KEY: &[u8] = b"head";

/// Marker key of the pruned-tail count.
const TAIL_KEY: &[u8] = b"tail";

/// Tuning knobs for the RocksDB backend.
pub struct RocksDbConfig {
    /// Block cache size in bytes; `None` uses the RocksDB default.
    pub block_cache_size: Option<usize>,
    /// Bloom filter bits per key; 0 disables bloom filters.
    pub bloom_filter_bits: f64,
    /// Memtable size in bytes.
    pub write_buffer_size: usize,
    /// Background compaction/flush jobs.
    pub max_background_jobs: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            block_cache_size: Some(256 * 1024 * 1024),
            bloom_filter_bits: 10.0,
            write_buffer_size: 64 * 1024 * 1024,
            max_background_jobs: 4,
        }
    }
}

/// A RocksDB database hosting both storage contracts.
///
/// [`kv`](Self::kv) and [`log`](Self::log) hand out cheap handles sharing the
/// same underlying database, so one atomic batch domain covers both.
pub struct RocksDb {
    db: Arc<DB>,
}

impl RocksDb {
    /// Open or create a database at `path` with default tuning.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = [STATE_CF, HISTORY_CF].into_iter().map(|name| {
            let mut cf_opts = Options::default();
            cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            ColumnFamilyDescriptor::new(name, cf_opts)
        });

        let path = path.as_ref();
        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tracing::debug!(path = %path.display(), "opened rocksdb store");

        Ok(Self { db: Arc::new(db) })
    }

    /// Key-value store handle over the `state` column family.
    pub fn kv(&self) -> RocksKv {
        RocksKv {
            db: self.db.clone(),
        }
    }

    /// Append log handle over the `history` column family.
    pub fn log(&self) -> RocksLog {
        RocksLog {
            db: self.db.clone(),
            lock: Mutex::new(()),
        }
    }
}

fn sync_write_opts() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

fn decode_marker(raw: Option<Vec<u8>>) -> Result<u64, StoreError> {
    match raw {
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::Backend(format!("log marker has {} bytes, want 8", bytes.len()))
            })?;
            Ok(u64::from_be_bytes(arr))
        }
        None => Ok(0),
    }
}

fn entry_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// RocksDB-backed [`KvStore`].
pub struct RocksKv {
    db: Arc<DB>,
}

impl RocksKv {
    fn cf(&self) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(STATE_CF)
            .expect("state column family must exist")
    }
}

impl KvRead for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get_cf(self.cf(), key)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn iter_from(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        let mut iter = self.db.raw_iterator_cf(self.cf());
        iter.seek(start);
        let prefix = prefix.to_vec();
        let mut done = false;

        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            if iter.valid() {
                let key = iter.key()?;
                if key.starts_with(&prefix) {
                    let k = key.to_vec();
                    let v = iter.value()?.to_vec();
                    iter.next();
                    Some((k, v))
                } else {
                    done = true;
                    None
                }
            } else {
                done = true;
                if let Err(e) = iter.status() {
                    panic!("RocksDB iterator error: {e}");
                }
                None
            }
        }))
    }
}

impl KvStore for RocksKv {
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let cf = self.cf();
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => rocks_batch.put_cf(cf, key, value),
                BatchOp::Delete { key } => rocks_batch.delete_cf(cf, key),
            }
        }
        self.db
            .write_opt(rocks_batch, &sync_write_opts())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn snapshot(&self) -> Box<dyn KvRead + '_> {
        Box::new(RocksSnapshot {
            snapshot: self.db.snapshot(),
            db: &self.db,
        })
    }
}

/// Point-in-time view of a [`RocksKv`].
///
/// Wraps RocksDB's native snapshot: writes applied after creation are
/// invisible through it. The snapshot must not outlive the database.
pub struct RocksSnapshot<'a> {
    snapshot: rocksdb::Snapshot<'a>,
    db: &'a DB,
}

impl RocksSnapshot<'_> {
    fn cf(&self) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(STATE_CF)
            .expect("state column family must exist")
    }
}

impl KvRead for RocksSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.snapshot
            .get_cf(self.cf(), key)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn iter_from(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        let mut iter = self.snapshot.raw_iterator_cf(self.cf());
        iter.seek(start);
        let prefix = prefix.to_vec();
        let mut done = false;

        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            if iter.valid() {
                let key = iter.key()?;
                if key.starts_with(&prefix) {
                    let k = key.to_vec();
                    let v = iter.value()?.to_vec();
                    iter.next();
                    Some((k, v))
                } else {
                    done = true;
                    None
                }
            } else {
                done = true;
                if let Err(e) = iter.status() {
                    panic!("RocksDB snapshot iterator error: {e}");
                }
                None
            }
        }))
    }
}

/// RocksDB-backed [`AppendLog`].
///
/// Entries live under their big-endian id; the `head`/`tail` markers are
/// updated in the same batch as the entries they describe, so the retained
/// range survives a crash consistently.
pub struct RocksLog {
    db: Arc<DB>,
    /// Serializes read-modify-write sequences on the head/tail markers.
    lock: Mutex<()>,
}

impl RocksLog {
    fn cf(&self) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(HISTORY_CF)
            .expect("history column family must exist")
    }

    fn read_marker(&self, key: &[u8]) -> Result<u64, StoreError> {
        decode_marker(
            self.db
                .get_cf(self.cf(), key)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        )
    }
}

impl AppendLog for RocksLog {
    fn head(&self) -> Result<u64, StoreError> {
        self.read_marker(HEAD_KEY)
    }

    fn tail(&self) -> Result<u64, StoreError> {
        self.read_marker(TAIL_KEY)
    }

    fn append(&self, id: u64, blob: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let head = self.read_marker(HEAD_KEY)?;
        if id != head + 1 {
            return Err(StoreError::GappedAppend {
                expected: head + 1,
                got: id,
            });
        }
        let cf = self.cf();
        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(cf, entry_key(id), blob);
        batch.put_cf(cf, HEAD_KEY, id.to_be_bytes());
        self.db
            .write_opt(batch, &sync_write_opts())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn get(&self, id: u64) -> Result<Option<Vec<u8>>, StoreError> {
        if id == 0 {
            return Ok(None);
        }
        let head = self.read_marker(HEAD_KEY)?;
        let tail = self.read_marker(TAIL_KEY)?;
        if id <= tail || id > head {
            return Ok(None);
        }
        self.db
            .get_cf(self.cf(), entry_key(id))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn truncate_head(&self, new_head: u64) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let head = self.read_marker(HEAD_KEY)?;
        if new_head >= head {
            return Ok(head);
        }
        let tail = self.read_marker(TAIL_KEY)?;
        let floor = new_head.max(tail);
        let cf = self.cf();
        let mut batch = rocksdb::WriteBatch::default();
        for id in (floor + 1)..=head {
            batch.delete_cf(cf, entry_key(id));
        }
        batch.put_cf(cf, HEAD_KEY, floor.to_be_bytes());
        self.db
            .write_opt(batch, &sync_write_opts())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(floor)
    }

    fn truncate_tail(&self, new_tail: u64) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let tail = self.read_marker(TAIL_KEY)?;
        if new_tail <= tail {
            return Ok(tail);
        }
        let head = self.read_marker(HEAD_KEY)?;
        let ceil = new_tail.min(head);
        let cf = self.cf();
        let mut batch = rocksdb::WriteBatch::default();
        for id in (tail + 1)..=ceil {
            batch.delete_cf(cf, entry_key(id));
        }
        batch.put_cf(cf, TAIL_KEY, ceil.to_be_bytes());
        self.db
            .write_opt(batch, &sync_write_opts())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(ceil)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksDb::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_kv_roundtrip_and_scan() {
        let (_dir, db) = open_temp();
        let kv = db.kv();

        let mut batch = WriteBatch::new();
        batch.put(b"a1".to_vec(), b"v1".to_vec());
        batch.put(b"a2".to_vec(), b"v2".to_vec());
        batch.put(b"b1".to_vec(), b"v3".to_vec());
        kv.write(batch).unwrap();

        assert_eq!(kv.get(b"a1").unwrap().unwrap(), b"v1");
        let scanned: Vec<_> = kv.iter_from(b"a", b"a").collect();
        assert_eq!(scanned.len(), 2);

        let snap = kv.snapshot();
        let mut batch = WriteBatch::new();
        batch.delete(b"a1".to_vec());
        kv.write(batch).unwrap();
        assert_eq!(snap.get(b"a1").unwrap().unwrap(), b"v1");
        assert_eq!(kv.get(b"a1").unwrap(), None);
    }

    #[test]
    fn test_log_roundtrip_and_truncation() {
        let (_dir, db) = open_temp();
        let log = db.log();

        for id in 1..=4 {
            log.append(id, &[id as u8]).unwrap();
        }
        assert!(matches!(log.append(9, b"x"), Err(StoreError::GappedAppend { .. })));

        assert_eq!(log.truncate_tail(1).unwrap(), 1);
        assert_eq!(log.get(1).unwrap(), None);
        assert_eq!(log.truncate_head(3).unwrap(), 3);
        assert_eq!(log.get(4).unwrap(), None);
        assert_eq!(log.get(3).unwrap().unwrap(), vec![3]);
        assert_eq!(log.head().unwrap(), 3);
        assert_eq!(log.tail().unwrap(), 1);
    }
}
