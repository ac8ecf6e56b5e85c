//! Redis adapter.
//!
//! The adapter speaks to the store through [`RedisConnection`], a narrow
//! command interface. Protocol framing and connection pooling live in the
//! connection implementation; with the `redis` feature enabled,
//! `redis::aio::ConnectionManager` implements it and translates client
//! errors into [`StorageError`] kinds.
//!
//! Command mapping:
//! - `set` is `SET key value [PX ms]`
//! - `add` is `SET key value NX [PX ms]`
//! - `replace` is `SET key value XX [PX ms]`, atomic on the server
//! - `get_many` is chunked `MGET`

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{normalize_ttl, StorageError, StorageResult};
use tracing::trace;

use crate::batch::{self, Deadline};
use crate::traits::{CacheBackend, CacheStats, DEFAULT_BATCH_CONCURRENCY};

/// Keys per `MGET` round trip.
pub const MGET_CHUNK: usize = 256;

/// Write condition of a `SET` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    Always,
    /// `XX`
    IfExists,
    /// `NX`
    IfAbsent,
}

/// Commands the adapter needs from a Redis client.
#[async_trait]
pub trait RedisConnection: Send + Sync {
    /// `SET` with an optional condition and `PX` expiry. Returns whether the
    /// value was written.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        condition: SetCondition,
        ttl: Option<Duration>,
    ) -> StorageResult<bool>;

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// `MGET`, one slot per key in request order.
    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Vec<u8>>>>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// `DEL`. Returns whether a key was removed.
    async fn del(&self, key: &str) -> StorageResult<bool>;
}

/// Backend over any [`RedisConnection`].
pub struct RedisBackend<C> {
    connection: C,
    batch_concurrency: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<C: RedisConnection> RedisBackend<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_batch_concurrency(mut self, limit: usize) -> Self {
        self.batch_concurrency = limit.max(1);
        self
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    fn count(&self, hits: usize, misses: usize) {
        self.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.misses.fetch_add(misses as u64, Ordering::Relaxed);
    }
}

impl<C> fmt::Debug for RedisBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("batch_concurrency", &self.batch_concurrency)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: RedisConnection> CacheBackend for RedisBackend<C> {
    fn name(&self) -> &str {
        "redis"
    }

    fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        trace!(key, "redis SET");
        self.connection
            .set(key, &value, SetCondition::Always, normalize_ttl(ttl))
            .await
            .map(|_| ())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let value = self.connection.get(key).await?;
        self.count(usize::from(value.is_some()), usize::from(value.is_none()));
        Ok(value)
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        self.connection.exists(key).await
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<bool> {
        trace!(key, "redis SET NX");
        self.connection
            .set(key, &value, SetCondition::IfAbsent, normalize_ttl(ttl))
            .await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        trace!(key, "redis SET XX");
        let written = self
            .connection
            .set(key, &value, SetCondition::IfExists, normalize_ttl(ttl))
            .await?;
        if written {
            Ok(())
        } else {
            Err(StorageError::not_found(key))
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        trace!(key, "redis DEL");
        self.connection.del(key).await
    }

    async fn get_many(
        &self,
        keys: &[String],
        deadline: Deadline,
    ) -> StorageResult<HashMap<String, Vec<u8>>> {
        let chunks: Vec<&[String]> = keys.chunks(MGET_CHUNK).collect();
        let replies = batch::dispatch(
            self.name(),
            chunks.clone(),
            self.batch_concurrency,
            deadline,
            |chunk| self.connection.mget(chunk),
        )
        .await;

        let mut found = HashMap::with_capacity(keys.len());
        for (chunk, reply) in chunks.into_iter().zip(replies) {
            let values = reply?;
            if values.len() != chunk.len() {
                return Err(StorageError::unavailable(
                    "redis",
                    format!("MGET returned {} values for {} keys", values.len(), chunk.len()),
                ));
            }
            for (key, value) in chunk.iter().zip(values) {
                if let Some(value) = value {
                    found.insert(key.clone(), value);
                }
            }
        }
        self.count(found.len(), keys.len().saturating_sub(found.len()));
        Ok(found)
    }

    async fn stats(&self) -> StorageResult<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..CacheStats::default()
        })
    }
}

#[cfg(feature = "redis")]
mod client {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::{RedisError, Value};
    use tracing::warn;

    /// Translate a client error into a backend error kind.
    fn translate(e: RedisError) -> StorageError {
        let translated = if e.is_timeout() {
            StorageError::timeout("redis")
        } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            StorageError::connection_failure("redis", &e)
        } else {
            StorageError::unavailable("redis", &e)
        };
        warn!(error = %e, kind = %translated, "Redis command failed");
        translated
    }

    impl RedisBackend<ConnectionManager> {
        /// Connect to `url` (e.g. `redis://127.0.0.1/`).
        pub async fn connect(url: &str) -> StorageResult<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| StorageError::connection_failure("redis", e))?;
            let manager = ConnectionManager::new(client).await.map_err(translate)?;
            Ok(Self::new(manager))
        }
    }

    #[async_trait]
    impl RedisConnection for ConnectionManager {
        async fn set(
            &self,
            key: &str,
            value: &[u8],
            condition: SetCondition,
            ttl: Option<Duration>,
        ) -> StorageResult<bool> {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            match condition {
                SetCondition::Always => {}
                SetCondition::IfExists => {
                    cmd.arg("XX");
                }
                SetCondition::IfAbsent => {
                    cmd.arg("NX");
                }
            }
            if let Some(ttl) = ttl {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                cmd.arg("PX").arg(millis);
            }
            let mut conn = self.clone();
            let reply: Value = cmd.query_async(&mut conn).await.map_err(translate)?;
            Ok(!matches!(reply, Value::Nil))
        }

        async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            let mut conn = self.clone();
            redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(translate)
        }

        async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Vec<u8>>>> {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut conn = self.clone();
            redis::cmd("MGET")
                .arg(keys)
                .query_async(&mut conn)
                .await
                .map_err(translate)
        }

        async fn exists(&self, key: &str) -> StorageResult<bool> {
            let mut conn = self.clone();
            let count: i64 = redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(translate)?;
            Ok(count > 0)
        }

        async fn del(&self, key: &str) -> StorageResult<bool> {
            let mut conn = self.clone();
            let count: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(translate)?;
            Ok(count > 0)
        }
    }
}
