//! RocksDB-backed replica store.
//!
//! Column families:
//! - `nodes`            : materialized node rows (JSON)
//! - `fragments`        : CRDT update fragments, keyed by `node_id ++ seq`
//! - `closure`          : `ancestor ++ descendant` → depth
//! - `closure_rev`      : `descendant ++ ancestor` → depth
//! - `collaborations`   : `node ++ collaborator` → grant
//! - `collaboration_log`: `collaborator ++ version` → grant (server cursor stream)
//! - `transactions`     : `root ++ version` → server transaction
//! - `transaction_ids`  : transaction id → `root ++ version`
//! - `outbox`           : mutation id (BE) → pending local mutation
//! - `cursors`          : collection key → last applied version
//! - `meta`             : counters and node markers
//!
//! All multi-row writes go through [`ReplicaStore::write`], which runs one
//! closure at a time and commits its [`UnitOfWork`] as a single atomic batch.
//! Reads made inside the closure observe committed state only.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

pub const CF_NODES: &str = "nodes";
pub const CF_FRAGMENTS: &str = "fragments";
pub const CF_CLOSURE: &str = "closure";
pub const CF_CLOSURE_REV: &str = "closure_rev";
pub const CF_COLLABORATIONS: &str = "collaborations";
pub const CF_COLLABORATION_LOG: &str = "collaboration_log";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_TRANSACTION_IDS: &str = "transaction_ids";
pub const CF_OUTBOX: &str = "outbox";
pub const CF_CURSORS: &str = "cursors";
pub const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[
    CF_NODES,
    CF_FRAGMENTS,
    CF_CLOSURE,
    CF_CLOSURE_REV,
    CF_COLLABORATIONS,
    CF_COLLABORATION_LOG,
    CF_TRANSACTIONS,
    CF_TRANSACTION_IDS,
    CF_OUTBOX,
    CF_CURSORS,
    CF_META,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canopy_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("missing column family: {0}")]
    MissingColumnFamily(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Composite key helpers. All integers are big-endian so RocksDB's
/// bytewise order matches numeric order.
pub mod keys {
    use uuid::Uuid;

    pub fn id(id: Uuid) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    pub fn pair(first: Uuid, second: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(first.as_bytes());
        key.extend_from_slice(second.as_bytes());
        key
    }

    pub fn sequenced(prefix: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(prefix.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn seq(seq: u64) -> [u8; 8] {
        seq.to_be_bytes()
    }

    pub fn split_pair(key: &[u8]) -> Option<(Uuid, Uuid)> {
        if key.len() != 32 {
            return None;
        }
        let first = Uuid::from_slice(&key[..16]).ok()?;
        let second = Uuid::from_slice(&key[16..]).ok()?;
        Some((first, second))
    }

    pub fn split_sequenced(key: &[u8]) -> Option<(Uuid, u64)> {
        if key.len() != 24 {
            return None;
        }
        let prefix = Uuid::from_slice(&key[..16]).ok()?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        Some((prefix, u64::from_be_bytes(buf)))
    }

    pub fn split_seq(key: &[u8]) -> Option<u64> {
        let buf: [u8; 8] = key.try_into().ok()?;
        Some(u64::from_be_bytes(buf))
    }
}

/// RocksDB-backed replica store shared by clients and the server.
pub struct ReplicaStore {
    /// RocksDB instance (single-threaded mode: concurrency via the write lock)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes units of work (single-writer boundary)
    write_lock: Mutex<()>,
}

impl ReplicaStore {
    /// Open the store at the configured path, creating missing column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened replica store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_NODES | CF_META | CF_CURSORS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_FRAGMENTS => {
                // Fragments are payloads compressed by the fragment log already.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_TRANSACTIONS | CF_COLLABORATION_LOG | CF_OUTBOX => {
                // Append-mostly, scanned in key order
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    pub(crate) fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    pub fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get_cf(self.cf(cf)?, key)?)
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &'static str, key: &[u8]) -> Result<Option<T>, StoreError> {
        self.get_raw(cf, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        self.get_raw(cf, key)?.map(|bytes| decode_json(&bytes)).transpose()
    }

    pub fn contains(&self, cf: &'static str, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get_raw(cf, key)?.is_some())
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(
        &self,
        cf: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.scan_from(cf, prefix, prefix, usize::MAX)
    }

    /// Entries starting at `start` while the key keeps `prefix`, up to `limit`.
    pub fn scan_from(
        &self,
        cf: &'static str,
        start: &[u8],
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let handle = self.cf(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    /// Last key of a column family, if any.
    pub fn last_key(&self, cf: &'static str) -> Result<Option<Vec<u8>>, StoreError> {
        let handle = self.cf(cf)?;
        let mut iter = self.db.iterator_cf(handle, IteratorMode::End);
        match iter.next() {
            Some(item) => Ok(Some(item?.0.to_vec())),
            None => Ok(None),
        }
    }

    /// Current value of a persisted counter.
    pub fn counter(&self, name: &str) -> Result<u64, StoreError> {
        Ok(self
            .get::<u64>(CF_META, &counter_key(name))?
            .unwrap_or_default())
    }

    /// Run `f` as one serialized unit of work and commit its batch atomically.
    ///
    /// Nothing is written if `f` returns an error. Reads made through
    /// [`UnitOfWork::store`] see committed state only, never the unit's own
    /// puts; counters from [`UnitOfWork::next_sequence`] are the exception.
    pub fn write<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<R, E>,
        E: From<StoreError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut uow = UnitOfWork {
            store: self,
            batch: WriteBatch::default(),
            counters: HashMap::new(),
        };
        let result = f(&mut uow)?;
        let UnitOfWork { batch, .. } = uow;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(StoreError::from)?;
        Ok(result)
    }
}

fn counter_key(name: &str) -> Vec<u8> {
    let mut key = b"counter:".to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

/// Pending writes of one [`ReplicaStore::write`] call.
pub struct UnitOfWork<'a> {
    store: &'a ReplicaStore,
    batch: WriteBatch,
    /// Counter values already handed out in this unit
    counters: HashMap<String, u64>,
}

impl<'a> UnitOfWork<'a> {
    /// Committed state, for reads inside the unit of work.
    ///
    /// Puts staged in this unit are not visible here until it commits.
    pub fn store(&self) -> &'a ReplicaStore {
        self.store
    }

    pub fn put_raw(&mut self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let handle = self.store.cf(cf)?;
        self.batch.put_cf(handle, key, value);
        Ok(())
    }

    pub fn put<T: Serialize>(&mut self, cf: &'static str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let bytes = encode(value)?;
        self.put_raw(cf, key, &bytes)
    }

    pub fn put_json<T: Serialize>(
        &mut self,
        cf: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = encode_json(value)?;
        self.put_raw(cf, key, &bytes)
    }

    pub fn delete(&mut self, cf: &'static str, key: &[u8]) -> Result<(), StoreError> {
        let handle = self.store.cf(cf)?;
        self.batch.delete_cf(handle, key);
        Ok(())
    }

    /// Next value of a persisted, strictly increasing counter.
    pub fn next_sequence(&mut self, name: &str) -> Result<u64, StoreError> {
        let current = match self.counters.get(name) {
            Some(value) => *value,
            None => self.store.counter(name)?,
        };
        let next = current + 1;
        self.counters.insert(name.to_string(), next);
        self.put(CF_META, &counter_key(name), &next)?;
        Ok(next)
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Per-node markers kept in `meta` (unreadable / out of sync).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMarker {
    Unreadable,
    OutOfSync,
}

impl NodeMarker {
    fn prefix(&self) -> &'static [u8] {
        match self {
            NodeMarker::Unreadable => b"unreadable:",
            NodeMarker::OutOfSync => b"out_of_sync:",
        }
    }

    pub fn key(&self, node_id: Uuid) -> Vec<u8> {
        let mut key = self.prefix().to_vec();
        key.extend_from_slice(node_id.as_bytes());
        key
    }

    /// Nodes carrying this marker, with the recorded reason.
    pub fn list(&self, store: &ReplicaStore) -> Result<Vec<(Uuid, String)>, StoreError> {
        let prefix = self.prefix();
        store
            .scan_prefix(CF_META, prefix)?
            .into_iter()
            .filter_map(|(key, value)| {
                let id = Uuid::from_slice(&key[prefix.len()..]).ok()?;
                Some(decode::<String>(&value).map(|reason| (id, reason)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> ReplicaStore {
        ReplicaStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("canopy_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_write_commits_atomically() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let id = Uuid::new_v4();

        store
            .write(|uow| -> Result<(), StoreError> {
                uow.put(CF_CURSORS, b"a", &1u64)?;
                uow.put(CF_CURSORS, &keys::id(id), &2u64)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get::<u64>(CF_CURSORS, b"a").unwrap(), Some(1));
        assert_eq!(store.get::<u64>(CF_CURSORS, &keys::id(id)).unwrap(), Some(2));
    }

    #[test]
    fn test_failed_unit_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let result = store.write(|uow| -> Result<(), StoreError> {
            uow.put(CF_CURSORS, b"a", &1u64)?;
            Err(StoreError::Database("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.get::<u64>(CF_CURSORS, b"a").unwrap(), None);
    }

    #[test]
    fn test_unit_reads_committed_state() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .write(|uow| -> Result<(), StoreError> { uow.put(CF_CURSORS, b"a", &1u64) })
            .unwrap();

        let seen = store
            .write(|uow| -> Result<Option<u64>, StoreError> {
                uow.put(CF_CURSORS, b"a", &2u64)?;
                uow.put(CF_CURSORS, b"b", &3u64)?;
                assert_eq!(uow.store().get::<u64>(CF_CURSORS, b"b")?, None);
                uow.store().get::<u64>(CF_CURSORS, b"a")
            })
            .unwrap();

        assert_eq!(seen, Some(1));
        assert_eq!(store.get::<u64>(CF_CURSORS, b"a").unwrap(), Some(2));
        assert_eq!(store.get::<u64>(CF_CURSORS, b"b").unwrap(), Some(3));
    }

    #[test]
    fn test_sequences_increase_within_and_across_units() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let (a, b) = store
            .write(|uow| -> Result<(u64, u64), StoreError> {
                Ok((uow.next_sequence("v")?, uow.next_sequence("v")?))
            })
            .unwrap();
        let c = store
            .write(|uow| -> Result<u64, StoreError> { uow.next_sequence("v") })
            .unwrap();

        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(store.counter("v").unwrap(), 3);
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let first = Uuid::from_u128(1);
        let second = Uuid::from_u128(2);

        store
            .write(|uow| -> Result<(), StoreError> {
                for seq in 0..3u64 {
                    uow.put(CF_TRANSACTIONS, &keys::sequenced(first, seq), &seq)?;
                    uow.put(CF_TRANSACTIONS, &keys::sequenced(second, seq), &seq)?;
                }
                Ok(())
            })
            .unwrap();

        let rows = store.scan_prefix(CF_TRANSACTIONS, first.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        let limited = store
            .scan_from(CF_TRANSACTIONS, &keys::sequenced(second, 1), second.as_bytes(), 10)
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(keys::split_sequenced(&limited[0].0), Some((second, 1)));
    }

    #[test]
    fn test_reopen_preserves_counters() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir);
            store
                .write(|uow| -> Result<u64, StoreError> { uow.next_sequence("outbox") })
                .unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.counter("outbox").unwrap(), 1);
    }

    #[test]
    fn test_node_markers() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let node = Uuid::new_v4();

        store
            .write(|uow| -> Result<(), StoreError> {
                uow.put(CF_META, &NodeMarker::OutOfSync.key(node), &"dropped".to_string())
            })
            .unwrap();

        let marked = NodeMarker::OutOfSync.list(&store).unwrap();
        assert_eq!(marked, vec![(node, "dropped".to_string())]);
        assert!(NodeMarker::Unreadable.list(&store).unwrap().is_empty());
    }
}
