//! In-process stand-ins for networked store clients.
//!
//! [`MockRedis`] and [`MockMemcached`] implement the connection traits over a
//! plain map so the Redis and memcached adapters can be exercised without a
//! server. They record what the adapter sent (TTL, exptime, call counts) and
//! can be told to fail. Expiry is recorded, not enforced.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{StorageError, StorageResult};

use crate::memcached_backend::{MemcachedConnection, StoreCommand};
use crate::redis_backend::{RedisConnection, SetCondition};

fn lock<'a, T>(mutex: &'a Mutex<T>, backend: &str) -> StorageResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| StorageError::unavailable(backend, "lock poisoned"))
}

/// Map-backed [`RedisConnection`].
#[derive(Debug, Default)]
pub struct MockRedis {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Duration>)>>,
    failure: Mutex<Option<StorageError>>,
    mget_calls: AtomicUsize,
}

impl MockRedis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following command fail with `error`.
    pub fn fail_with(&self, error: StorageError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error);
        }
    }

    pub fn recover(&self) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
    }

    /// `PX` expiry sent with the last write of `key`.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).and_then(|(_, ttl)| *ttl))
    }

    pub fn mget_calls(&self) -> usize {
        self.mget_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StorageResult<()> {
        match lock(&self.failure, "redis")?.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RedisConnection for MockRedis {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        condition: SetCondition,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        self.check()?;
        let mut entries = lock(&self.entries, "redis")?;
        let exists = entries.contains_key(key);
        let write = match condition {
            SetCondition::Always => true,
            SetCondition::IfExists => exists,
            SetCondition::IfAbsent => !exists,
        };
        if write {
            entries.insert(key.to_string(), (value.to_vec(), ttl));
        }
        Ok(write)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(lock(&self.entries, "redis")?
            .get(key)
            .map(|(value, _)| value.clone()))
    }

    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        self.check()?;
        self.mget_calls.fetch_add(1, Ordering::SeqCst);
        let entries = lock(&self.entries, "redis")?;
        Ok(keys
            .iter()
            .map(|key| entries.get(key).map(|(value, _)| value.clone()))
            .collect())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check()?;
        Ok(lock(&self.entries, "redis")?.contains_key(key))
    }

    async fn del(&self, key: &str) -> StorageResult<bool> {
        self.check()?;
        Ok(lock(&self.entries, "redis")?.remove(key).is_some())
    }
}

/// Map-backed [`MemcachedConnection`].
#[derive(Debug, Default)]
pub struct MockMemcached {
    entries: Mutex<HashMap<String, (Vec<u8>, u32)>>,
    failing: Mutex<HashSet<String>>,
}

impl MockMemcached {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command on the wire key `key` fail.
    pub fn fail_key(&self, key: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(key.into());
        }
    }

    pub fn contains(&self, wire_key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(wire_key))
            .unwrap_or(false)
    }

    /// `exptime` sent with the last write of `wire_key`.
    pub fn exptime_of(&self, wire_key: &str) -> Option<u32> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(wire_key).map(|(_, exptime)| *exptime))
    }

    fn check(&self, key: &str) -> StorageResult<()> {
        if lock(&self.failing, "memcached")?.contains(key) {
            Err(StorageError::unavailable(
                "memcached",
                format!("SERVER_ERROR injected for {}", key),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MemcachedConnection for MockMemcached {
    async fn store(
        &self,
        command: StoreCommand,
        key: &str,
        value: &[u8],
        exptime: u32,
    ) -> StorageResult<bool> {
        self.check(key)?;
        let mut entries = lock(&self.entries, "memcached")?;
        let exists = entries.contains_key(key);
        let store = match command {
            StoreCommand::Set => true,
            StoreCommand::Add => !exists,
            StoreCommand::Replace => exists,
        };
        if store {
            entries.insert(key.to_string(), (value.to_vec(), exptime));
        }
        Ok(store)
    }

    async fn get_multi(&self, keys: &[String]) -> StorageResult<HashMap<String, Vec<u8>>> {
        for key in keys {
            self.check(key)?;
        }
        let entries = lock(&self.entries, "memcached")?;
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|(value, _)| (key.clone(), value.clone())))
            .collect())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.check(key)?;
        Ok(lock(&self.entries, "memcached")?.remove(key).is_some())
    }
}
