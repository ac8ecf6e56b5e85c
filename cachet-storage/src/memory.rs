//! In-process backend on a lock-guarded map.
//!
//! TTL is enforced lazily: an expired entry is ignored by every read and is
//! physically dropped when it is overwritten, deleted, or reaped because the
//! map went over its capacity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{normalize_ttl, StorageError, StorageResult};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::batch::Deadline;
use crate::traits::{CacheBackend, CacheStats};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            expires_at: normalize_ttl(ttl).and_then(|ttl| now.checked_add(ttl)),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-memory backend.
///
/// Batch operations run sequentially under one lock acquisition, so they
/// never hide latency and the deadline cannot elapse halfway through.
pub struct MemoryBackend {
    name: String,
    entries: RwLock<HashMap<String, Entry>>,
    capacity: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryBackend {
    /// Unbounded backend named `memory`.
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            entries: RwLock::new(HashMap::new()),
            capacity: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Backend holding at most `threshold` entries.
    ///
    /// A write that pushes the map over the threshold first drops expired
    /// entries, then evicts arbitrary other entries until it fits again. The
    /// entry just written is never the one evicted.
    pub fn with_capacity(threshold: usize) -> Self {
        Self {
            capacity: Some(threshold.max(1)),
            ..Self::new()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of live entries.
    pub fn len(&self) -> StorageResult<usize> {
        let now = Instant::now();
        Ok(self.read()?.values().filter(|e| e.is_live(now)).count())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every entry.
    pub fn clear(&self) -> StorageResult<()> {
        self.write()?.clear();
        Ok(())
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|_| StorageError::unavailable(&self.name, "lock poisoned"))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|_| StorageError::unavailable(&self.name, "lock poisoned"))
    }

    fn lookup(&self, map: &HashMap<String, Entry>, key: &str, now: Instant) -> Option<Vec<u8>> {
        match map.get(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(
        &self,
        map: &mut HashMap<String, Entry>,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        now: Instant,
    ) {
        map.insert(key.to_string(), Entry::new(value, ttl, now));
        self.enforce_capacity(map, key, now);
    }

    fn add_locked(
        &self,
        map: &mut HashMap<String, Entry>,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        now: Instant,
    ) -> bool {
        if map.get(key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        self.insert(map, key, value, ttl, now);
        true
    }

    fn replace_locked(
        &self,
        map: &mut HashMap<String, Entry>,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        now: Instant,
    ) -> StorageResult<()> {
        match map.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                *entry = Entry::new(value, ttl, now);
                Ok(())
            }
            None => Err(StorageError::not_found(key)),
        }
    }

    fn delete_locked(map: &mut HashMap<String, Entry>, key: &str, now: Instant) -> bool {
        map.remove(key).is_some_and(|e| e.is_live(now))
    }

    fn enforce_capacity(&self, map: &mut HashMap<String, Entry>, keep: &str, now: Instant) {
        let Some(capacity) = self.capacity else {
            return;
        };
        if map.len() <= capacity {
            return;
        }

        let before = map.len();
        map.retain(|_, e| e.is_live(now));
        let reaped = before - map.len();

        let overflow = map.len().saturating_sub(capacity);
        let victims: Vec<String> = map
            .keys()
            .filter(|k| k.as_str() != keep)
            .take(overflow)
            .cloned()
            .collect();
        for key in &victims {
            map.remove(key);
        }
        self.evictions
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        debug!(
            backend = %self.name,
            reaped,
            evicted = victims.len(),
            "Memory backend over capacity"
        );
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        trace!(backend = %self.name, key, "set");
        let mut map = self.write()?;
        self.insert(&mut map, key, value, ttl, Instant::now());
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        trace!(backend = %self.name, key, "get");
        let map = self.read()?;
        Ok(self.lookup(&map, key, Instant::now()))
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();
        Ok(self.read()?.get(key).is_some_and(|e| e.is_live(now)))
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<bool> {
        trace!(backend = %self.name, key, "add");
        let mut map = self.write()?;
        Ok(self.add_locked(&mut map, key, value, ttl, Instant::now()))
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        trace!(backend = %self.name, key, "replace");
        let mut map = self.write()?;
        self.replace_locked(&mut map, key, value, ttl, Instant::now())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        trace!(backend = %self.name, key, "delete");
        let mut map = self.write()?;
        Ok(Self::delete_locked(&mut map, key, Instant::now()))
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
        _deadline: Deadline,
    ) -> Vec<StorageResult<()>> {
        let mut map = match self.write() {
            Ok(map) => map,
            Err(e) => return vec![Err(e); entries.len()],
        };
        let now = Instant::now();
        entries
            .into_iter()
            .map(|(key, value)| {
                self.insert(&mut map, &key, value, ttl, now);
                Ok(())
            })
            .collect()
    }

    async fn get_many(
        &self,
        keys: &[String],
        _deadline: Deadline,
    ) -> StorageResult<HashMap<String, Vec<u8>>> {
        let map = self.read()?;
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|key| self.lookup(&map, key, now).map(|v| (key.clone(), v)))
            .collect())
    }

    async fn add_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
        _deadline: Deadline,
    ) -> Vec<StorageResult<bool>> {
        let mut map = match self.write() {
            Ok(map) => map,
            Err(e) => return vec![Err(e); entries.len()],
        };
        let now = Instant::now();
        entries
            .into_iter()
            .map(|(key, value)| Ok(self.add_locked(&mut map, &key, value, ttl, now)))
            .collect()
    }

    async fn replace_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
        _deadline: Deadline,
    ) -> Vec<StorageResult<()>> {
        let mut map = match self.write() {
            Ok(map) => map,
            Err(e) => return vec![Err(e); entries.len()],
        };
        let now = Instant::now();
        entries
            .into_iter()
            .map(|(key, value)| self.replace_locked(&mut map, &key, value, ttl, now))
            .collect()
    }

    async fn delete_many(&self, keys: &[String], _deadline: Deadline) -> Vec<StorageResult<bool>> {
        let mut map = match self.write() {
            Ok(map) => map,
            Err(e) => return vec![Err(e); keys.len()],
        };
        let now = Instant::now();
        keys.iter()
            .map(|key| Ok(Self::delete_locked(&mut map, key, now)))
            .collect()
    }

    async fn stats(&self) -> StorageResult<CacheStats> {
        let map = self.read()?;
        let now = Instant::now();
        let (entry_count, memory_bytes) = map
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .fold((0u64, 0u64), |(count, bytes), (k, e)| {
                (count + 1, bytes + (k.len() + e.value.len()) as u64)
            });
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
