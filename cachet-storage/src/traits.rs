//! Cache backend trait and statistics.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::StorageResult;

use crate::batch::{self, Deadline};

/// Batch fan-out used when a backend does not configure its own.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 16;

/// Cache backend trait for pluggable store implementations.
///
/// Keys are opaque strings and values opaque bytes; the backend never
/// inspects payloads. Implementations must be safe to call concurrently
/// without external locking.
///
/// # Errors
///
/// Every method reports failures as [`StorageError`](cachet_core::StorageError).
/// A miss is never an error: `get` returns `None` and `delete` returns
/// `false`. `NotFound` is only produced by `replace` and `replace_many`.
///
/// # TTL
///
/// `None` and `Some(Duration::ZERO)` both mean "never expires". An entry past
/// its TTL behaves exactly like an absent one.
///
/// # Batches
///
/// The `_many` methods are never atomic across keys. Each returns one outcome
/// per input, in input order, and one key's failure never aborts the others.
/// Sub-operations still pending when the deadline passes are reported as
/// `Timeout`; those already applied stand. The provided implementations fan
/// out the single-key methods with at most [`batch_concurrency`] in flight.
///
/// [`batch_concurrency`]: CacheBackend::batch_concurrency
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Short backend name used in errors and logs.
    fn name(&self) -> &str;

    /// Maximum in-flight sub-operations for one batch call.
    fn batch_concurrency(&self) -> usize {
        DEFAULT_BATCH_CONCURRENCY
    }

    /// Unconditional write. Idempotent.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()>;

    /// Read a value; `None` on miss.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Whether a live entry exists under `key`.
    async fn has(&self, key: &str) -> StorageResult<bool>;

    /// Write only if no live entry exists. Returns whether the entry was
    /// created.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<bool>;

    /// Overwrite an existing entry. Fails with `NotFound` and creates nothing
    /// when the key is absent.
    async fn replace(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> StorageResult<()>;

    /// Remove an entry. Returns whether one existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    async fn set_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> Vec<StorageResult<()>> {
        batch::dispatch(
            self.name(),
            entries,
            self.batch_concurrency(),
            deadline,
            |(key, value)| async move { self.set(&key, value, ttl).await },
        )
        .await
    }

    /// Read several keys. Absent keys are left out of the result.
    ///
    /// Reads have no side effects, so a failing sub-read or an elapsed
    /// deadline fails the whole call.
    async fn get_many(
        &self,
        keys: &[String],
        deadline: Deadline,
    ) -> StorageResult<HashMap<String, Vec<u8>>> {
        let values = batch::dispatch(
            self.name(),
            keys.to_vec(),
            self.batch_concurrency(),
            deadline,
            |key| async move { self.get(&key).await },
        )
        .await;

        let mut found = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            if let Some(value) = value? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn add_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> Vec<StorageResult<bool>> {
        batch::dispatch(
            self.name(),
            entries,
            self.batch_concurrency(),
            deadline,
            |(key, value)| async move { self.add(&key, value, ttl).await },
        )
        .await
    }

    async fn replace_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
        deadline: Deadline,
    ) -> Vec<StorageResult<()>> {
        batch::dispatch(
            self.name(),
            entries,
            self.batch_concurrency(),
            deadline,
            |(key, value)| async move { self.replace(&key, value, ttl).await },
        )
        .await
    }

    async fn delete_many(&self, keys: &[String], deadline: Deadline) -> Vec<StorageResult<bool>> {
        batch::dispatch(
            self.name(),
            keys.to_vec(),
            self.batch_concurrency(),
            deadline,
            |key| async move { self.delete(&key).await },
        )
        .await
    }

    /// Get cache statistics.
    async fn stats(&self) -> StorageResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache, when the store reports it.
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
