//! LMDB-backed persistent cache.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives process restarts.
//!
//! # Value Layout
//!
//! `[expires_at: 8 bytes LE unix millis, 0 = never][payload]`
//!
//! Expiry is checked on read. Expired entries are overwritten by `add`, left
//! alone by `replace` (which then reports `NotFound`), and dropped in bulk by
//! [`LmdbBackend::purge_expired`].
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get` and `has`
//! - One write transaction per conditional write, so `add` and `replace` are
//!   atomic check-and-set operations
//! - Hit/miss statistics behind an `RwLock`

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{normalize_ttl, StorageError, StorageResult};
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use tracing::{debug, trace};

use crate::traits::{CacheBackend, CacheStats};

const BACKEND: &str = "lmdb";
const HEADER_LEN: usize = 8;

fn unavailable(e: heed::Error) -> StorageError {
    StorageError::unavailable(BACKEND, e)
}

/// Frame a payload with its expiry header.
fn frame(value: &[u8], ttl: Option<Duration>, now_millis: i64) -> Vec<u8> {
    let expires_at = normalize_ttl(ttl)
        .map(|ttl| {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            now_millis.saturating_add(millis).max(1)
        })
        .unwrap_or(0);

    let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
    bytes.extend_from_slice(&expires_at.to_le_bytes());
    bytes.extend_from_slice(value);
    bytes
}

/// Payload of a framed entry, or `None` when expired or malformed.
fn unframe(bytes: &[u8], now_millis: i64) -> Option<&[u8]> {
    let header: [u8; HEADER_LEN] = bytes.get(..HEADER_LEN)?.try_into().ok()?;
    let expires_at = i64::from_le_bytes(header);
    if expires_at != 0 && expires_at <= now_millis {
        return None;
    }
    Some(&bytes[HEADER_LEN..])
}

/// LMDB-backed cache.
///
/// # Example
///
/// ```ignore
/// use cachet_storage::{CacheBackend, LmdbBackend};
///
/// let backend = LmdbBackend::open("/tmp/cachet", 100)?;
/// backend.set("user:1", bytes, None).await?;
/// let cached = backend.get("user:1").await?;
/// ```
pub struct LmdbBackend {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl LmdbBackend {
    /// Open or create an LMDB cache.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailure` if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> StorageResult<Self> {
        std::fs::create_dir_all(&path)
            .map_err(|e| StorageError::connection_failure(BACKEND, e))?;

        // SAFETY: the environment is opened once per directory and never
        // mapped by another handle of this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| StorageError::connection_failure(BACKEND, e))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StorageError::connection_failure(BACKEND, e))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| StorageError::connection_failure(BACKEND, e))?;
        wtxn.commit()
            .map_err(|e| StorageError::connection_failure(BACKEND, e))?;

        debug!(path = %path.as_ref().display(), max_size_mb, "Opened LMDB cache");
        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    /// Delete every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> StorageResult<u64> {
        let now = Utc::now().timestamp_millis();
        let expired = {
            let rtxn = self.env.read_txn().map_err(unavailable)?;
            let mut keys = Vec::new();
            for result in self.db.iter(&rtxn).map_err(unavailable)? {
                let (key, bytes) = result.map_err(unavailable)?;
                if unframe(bytes, now).is_none() {
                    keys.push(key.to_vec());
                }
            }
            keys
        };

        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        let mut deleted = 0u64;
        for key in &expired {
            if self.db.delete(&mut wtxn, key).map_err(unavailable)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(unavailable)?;

        debug!(deleted, "Purged expired LMDB entries");
        Ok(deleted)
    }

    fn live_value(&self, txn: &RoTxn, key: &str, now: i64) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(txn, key.as_bytes())
            .map_err(unavailable)?
            .and_then(|bytes| unframe(bytes, now))
            .map(<[u8]>::to_vec))
    }

    fn record_lookup(&self, hit: bool) {
        if let Ok(mut stats) = self.stats.write() {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
    }
}

impl std::fmt::Debug for LmdbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbBackend")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBackend for LmdbBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        trace!(key, "lmdb set");
        let framed = frame(&value, ttl, Utc::now().timestamp_millis());
        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &framed)
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(unavailable)?;
        let value = self.live_value(&rtxn, key, Utc::now().timestamp_millis())?;
        self.record_lookup(value.is_some());
        Ok(value)
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        let rtxn = self.env.read_txn().map_err(unavailable)?;
        Ok(self
            .live_value(&rtxn, key, Utc::now().timestamp_millis())?
            .is_some())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<bool> {
        trace!(key, "lmdb add");
        let now = Utc::now().timestamp_millis();
        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        if self.live_value(&wtxn, key, now)?.is_some() {
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), &frame(&value, ttl, now))
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)?;
        Ok(true)
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        trace!(key, "lmdb replace");
        let now = Utc::now().timestamp_millis();
        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        if self.live_value(&wtxn, key, now)?.is_none() {
            return Err(StorageError::not_found(key));
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), &frame(&value, ttl, now))
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        trace!(key, "lmdb delete");
        let now = Utc::now().timestamp_millis();
        let mut wtxn = self.env.write_txn().map_err(unavailable)?;
        let existed = self.live_value(&wtxn, key, now)?.is_some();
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)?;
        Ok(existed)
    }

    async fn stats(&self) -> StorageResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(unavailable)?;
        let entry_count = self.db.len(&rtxn).map_err(unavailable)?;
        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.entry_count = entry_count;
        stats.memory_bytes = self.env.real_disk_size().unwrap_or(0);
        Ok(stats)
    }
}
