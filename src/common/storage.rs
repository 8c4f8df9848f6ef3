//! Persistent and in-memory storage for the consensus log and snapshots.
//!
//! Supports in-memory (default), Sled (`sled-backend`) and RocksDB
//! (`rocksdb`) backends. Every record is framed with a CRC32 checksum.

use crate::common::raft::{LogEntry, Snapshot};
use crate::common::{crc32, Error, Result, StorageBackend};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "rocksdb")]
use rocksdb::{Options, DB};

#[cfg(any(feature = "sled-backend", feature = "rocksdb"))]
const SNAPSHOT_KEY: &[u8] = b"snapshot";

/// Trait for log storage backends
pub trait LogStore: Send + Sync {
    fn append(&self, entry: &LogEntry) -> Result<()>;

    /// Entries with an index strictly greater than `index`, in order.
    fn entries_after(&self, index: u64) -> Result<Vec<LogEntry>>;

    /// Persist a snapshot and drop the entries it covers.
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// Prefix `bytes` with their checksum.
pub fn encode_frame(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 4);
    out.extend_from_slice(&crc32(bytes).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Verify and strip the checksum prefix.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 4 {
        return Err(Error::Corrupted(format!("frame too short: {} bytes", frame.len())));
    }
    let (head, body) = frame.split_at(4);
    let expected = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let actual = crc32(body);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(encode_frame(&bincode::serialize(value)?))
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(decode_frame(frame)?)?)
}

/// In-memory store (default)
#[derive(Default)]
pub struct MemStore {
    log: Mutex<BTreeMap<u64, Vec<u8>>>,
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemStore {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        self.log.lock().insert(entry.index, encode(entry)?);
        Ok(())
    }

    fn entries_after(&self, index: u64) -> Result<Vec<LogEntry>> {
        self.log
            .lock()
            .range(index + 1..)
            .map(|(_, frame)| decode(frame))
            .collect()
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock() = Some(encode(snapshot)?);
        let mut log = self.log.lock();
        *log = log.split_off(&(snapshot.index + 1));
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        self.snapshot.lock().as_deref().map(decode).transpose()
    }
}

/// Sled store
#[cfg(feature = "sled-backend")]
pub struct SledStore {
    log: sled::Tree,
    meta: sled::Tree,
}

#[cfg(feature = "sled-backend")]
impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        let log = db
            .open_tree("log")
            .map_err(|e| Error::Storage(e.to_string()))?;
        let meta = db
            .open_tree("meta")
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { log, meta })
    }
}

#[cfg(feature = "sled-backend")]
impl LogStore for SledStore {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        self.log
            .insert(entry.index.to_be_bytes(), encode(entry)?)
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.log
            .flush()
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn entries_after(&self, index: u64) -> Result<Vec<LogEntry>> {
        let start = (index + 1).to_be_bytes();
        self.log
            .range(start..)
            .map(|item| {
                let (_, frame) = item.map_err(|e| Error::Storage(e.to_string()))?;
                decode(&frame)
            })
            .collect()
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.meta
            .insert(SNAPSHOT_KEY, encode(snapshot)?)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let end = (snapshot.index + 1).to_be_bytes();
        for item in self.log.range(..end) {
            let (key, _) = item.map_err(|e| Error::Storage(e.to_string()))?;
            self.log
                .remove(key)
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        self.meta
            .flush()
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        match self
            .meta
            .get(SNAPSHOT_KEY)
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            Some(frame) => Ok(Some(decode(&frame)?)),
            None => Ok(None),
        }
    }
}

/// RocksDB store
#[cfg(feature = "rocksdb")]
pub struct RocksStore {
    db: DB,
}

#[cfg(feature = "rocksdb")]
const CF_LOG: &str = "log";
#[cfg(feature = "rocksdb")]
const CF_META: &str = "meta";

#[cfg(feature = "rocksdb")]
impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, path, vec![CF_LOG, CF_META])
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("missing column family {}", name)))
    }
}

#[cfg(feature = "rocksdb")]
impl LogStore for RocksStore {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_LOG)?, entry.index.to_be_bytes(), encode(entry)?)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn entries_after(&self, index: u64) -> Result<Vec<LogEntry>> {
        let start = (index + 1).to_be_bytes();
        let iter = self.db.iterator_cf(
            self.cf(CF_LOG)?,
            rocksdb::IteratorMode::From(&start, rocksdb::Direction::Forward),
        );
        iter.map(|item| {
            let (_, frame) = item.map_err(|e| Error::Storage(e.to_string()))?;
            decode(&frame)
        })
        .collect()
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_META)?, SNAPSHOT_KEY, encode(snapshot)?)
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.db
            .delete_range_cf(
                self.cf(CF_LOG)?,
                0u64.to_be_bytes(),
                (snapshot.index + 1).to_be_bytes(),
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.db.flush().map_err(|e| Error::Storage(e.to_string()))
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        match self
            .db
            .get_cf(self.cf(CF_META)?, SNAPSHOT_KEY)
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            Some(frame) => Ok(Some(decode(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Open the configured backend.
pub fn open_store(backend: StorageBackend, path: &Path) -> Result<Arc<dyn LogStore>> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemStore::new())),
        #[cfg(feature = "sled-backend")]
        StorageBackend::Sled => Ok(Arc::new(SledStore::open(path)?)),
        #[cfg(feature = "rocksdb")]
        StorageBackend::Rocksdb => Ok(Arc::new(RocksStore::open(path)?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::InvalidConfig(format!(
            "storage backend {:?} not compiled in (path {})",
            other,
            path.display()
        ))),
    }
}
