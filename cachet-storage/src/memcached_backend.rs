//! Memcached adapter.
//!
//! Memcached has native `add` and `replace` storage commands, so conditional
//! writes are atomic on the server. Two protocol limits are handled here:
//!
//! - Expiry: values up to 30 days are sent as relative seconds; longer ones
//!   must be absolute unix timestamps.
//! - Keys: at most 250 bytes, no whitespace or control characters. Other keys,
//!   and keys that already look like a digest, are sent as
//!   `sha256:<hex digest>`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{normalize_ttl, StorageError, StorageResult};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::batch::{self, Deadline};
use crate::traits::{CacheBackend, CacheStats, DEFAULT_BATCH_CONCURRENCY};

/// Longest key memcached accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Largest expiry memcached treats as relative seconds.
pub const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;

/// Keys per multi-get round trip.
pub const GET_MULTI_CHUNK: usize = 128;

/// Memcached storage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
}

/// Commands the adapter needs from a memcached client.
#[async_trait]
pub trait MemcachedConnection: Send + Sync {
    /// Run a storage command. Returns `true` for `STORED`, `false` for
    /// `NOT_STORED`.
    async fn store(
        &self,
        command: StoreCommand,
        key: &str,
        value: &[u8],
        exptime: u32,
    ) -> StorageResult<bool>;

    /// Multi-key `get`. Missing keys are absent from the result.
    async fn get_multi(&self, keys: &[String]) -> StorageResult<HashMap<String, Vec<u8>>>;

    /// Returns `true` for `DELETED`, `false` for `NOT_FOUND`.
    async fn delete(&self, key: &str) -> StorageResult<bool>;
}

const DIGEST_PREFIX: &str = "sha256:";

/// Key as sent on the wire. Keys passed through unchanged never start with
/// the digest prefix, so they cannot collide with a digest.
pub fn wire_key(key: &str) -> Cow<'_, str> {
    let valid = key.len() <= MAX_KEY_LEN
        && !key.is_empty()
        && !key.starts_with(DIGEST_PREFIX)
        && !key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
    if valid {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(format!("{}{}", DIGEST_PREFIX, hex::encode(Sha256::digest(key.as_bytes()))))
    }
}

/// Protocol `exptime` for a TTL at `now` (unix seconds).
pub fn exptime(ttl: Option<Duration>, now: i64) -> u32 {
    let Some(ttl) = normalize_ttl(ttl) else {
        return 0;
    };
    // Round up so sub-second TTLs do not become "never".
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    if secs <= MAX_RELATIVE_EXPIRY {
        secs as u32
    } else {
        let absolute = u64::try_from(now).unwrap_or(0).saturating_add(secs);
        u32::try_from(absolute).unwrap_or(u32::MAX)
    }
}

/// Backend over any [`MemcachedConnection`].
pub struct MemcachedBackend<C> {
    connection: C,
    batch_concurrency: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<C: MemcachedConnection> MemcachedBackend<C> {
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

    async fn store(
        &self,
        command: StoreCommand,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let wire = wire_key(key);
        trace!(key, wire = %wire, ?command, "memcached store");
        self.connection
            .store(command, &wire, value, exptime(ttl, Utc::now().timestamp()))
            .await
    }

    fn count(&self, hits: usize, misses: usize) {
        self.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.misses.fetch_add(misses as u64, Ordering::Relaxed);
    }
}

impl<C> fmt::Debug for MemcachedBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedBackend")
            .field("batch_concurrency", &self.batch_concurrency)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: MemcachedConnection> CacheBackend for MemcachedBackend<C> {
    fn name(&self) -> &str {
        "memcached"
    }

    fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        let stored = self.store(StoreCommand::Set, key, &value, ttl).await?;
        if stored {
            Ok(())
        } else {
            Err(StorageError::unavailable("memcached", "set was not stored"))
        }
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let wire = wire_key(key).into_owned();
        let mut found = self
            .connection
            .get_multi(std::slice::from_ref(&wire))
            .await?;
        let value = found.remove(&wire);
        self.count(usize::from(value.is_some()), usize::from(value.is_none()));
        Ok(value)
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        let wire = wire_key(key).into_owned();
        let found = self
            .connection
            .get_multi(std::slice::from_ref(&wire))
            .await?;
        Ok(found.contains_key(&wire))
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<bool> {
        self.store(StoreCommand::Add, key, &value, ttl).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        if self.store(StoreCommand::Replace, key, &value, ttl).await? {
            Ok(())
        } else {
            Err(StorageError::not_found(key))
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        trace!(key, "memcached delete");
        self.connection.delete(&wire_key(key)).await
    }

    async fn get_many(
        &self,
        keys: &[String],
        deadline: Deadline,
    ) -> StorageResult<HashMap<String, Vec<u8>>> {
        let mut originals: HashMap<String, &String> = HashMap::with_capacity(keys.len());
        for key in keys {
            originals.insert(wire_key(key).into_owned(), key);
        }
        let wire_keys: Vec<String> = originals.keys().cloned().collect();

        let replies = batch::dispatch(
            self.name(),
            wire_keys.chunks(GET_MULTI_CHUNK).collect::<Vec<_>>(),
            self.batch_concurrency,
            deadline,
            |chunk| self.connection.get_multi(chunk),
        )
        .await;

        let mut found = HashMap::with_capacity(keys.len());
        for reply in replies {
            for (wire, value) in reply? {
                if let Some(original) = originals.get(&wire) {
                    found.insert((*original).clone(), value);
                }
            }
        }
        self.count(found.len(), originals.len().saturating_sub(found.len()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMemcached;

    #[test]
    fn test_wire_key() {
        assert_eq!(wire_key("user:1"), "user:1");

        let long = "k".repeat(MAX_KEY_LEN + 1);
        let mapped = wire_key(&long);
        assert!(mapped.starts_with("sha256:"));
        assert_eq!(mapped.len(), "sha256:".len() + 64);
        assert_eq!(mapped, wire_key(&long));

        assert!(wire_key("user:john doe").starts_with("sha256:"));
        assert!(wire_key("tab\there").starts_with("sha256:"));
        assert_ne!(wire_key("a b"), wire_key("a  b"));

        let digest = wire_key("user:john doe").into_owned();
        let rehashed = wire_key(&digest);
        assert!(rehashed.starts_with("sha256:"));
        assert_ne!(rehashed, digest);
    }

    #[test]
    fn test_exptime() {
        let now = 1_700_000_000;
        assert_eq!(exptime(None, now), 0);
        assert_eq!(exptime(Some(Duration::ZERO), now), 0);
        assert_eq!(exptime(Some(Duration::from_millis(10)), now), 1);
        assert_eq!(exptime(Some(Duration::from_secs(60)), now), 60);
        assert_eq!(
            exptime(Some(Duration::from_secs(MAX_RELATIVE_EXPIRY)), now),
            MAX_RELATIVE_EXPIRY as u32
        );
        let long = Duration::from_secs(MAX_RELATIVE_EXPIRY + 1);
        assert_eq!(
            exptime(Some(long), now),
            (now as u64 + MAX_RELATIVE_EXPIRY + 1) as u32
        );
    }

    #[tokio::test]
    async fn test_command_semantics() {
        let backend = MemcachedBackend::new(MockMemcached::new());
        assert_eq!(backend.get("k").await.expect("get should succeed"), None);

        let err = backend
            .replace("k", b"v".to_vec(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!backend.has("k").await.expect("has should succeed"));

        assert!(backend
            .add("k", b"v0".to_vec(), None)
            .await
            .expect("add should succeed"));
        assert!(!backend
            .add("k", b"x".to_vec(), None)
            .await
            .expect("add should succeed"));
        backend
            .replace("k", b"v1".to_vec(), None)
            .await
            .expect("replace should succeed");
        assert_eq!(
            backend.get("k").await.expect("get should succeed"),
            Some(b"v1".to_vec())
        );
        assert!(backend.delete("k").await.expect("delete should succeed"));
        assert!(!backend.delete("k").await.expect("delete should succeed"));
    }

    #[tokio::test]
    async fn test_hashed_keys_round_trip() {
        let backend = MemcachedBackend::new(MockMemcached::new());
        let key = format!("note:{}", "x".repeat(300));
        backend
            .set(&key, b"long".to_vec(), None)
            .await
            .expect("set should succeed");
        backend
            .set("user:has space", b"spaced".to_vec(), None)
            .await
            .expect("set should succeed");
        assert!(backend.connection().contains(&wire_key(&key)));

        let found = backend
            .get_many(
                &[key.clone(), "user:has space".to_string(), "missing".to_string()],
                Deadline::none(),
            )
            .await
            .expect("get_many should succeed");
        assert_eq!(found.len(), 2);
        assert_eq!(found.get(&key), Some(&b"long".to_vec()));
        assert_eq!(found.get("user:has space"), Some(&b"spaced".to_vec()));
    }

    #[tokio::test]
    async fn test_digest_shaped_key_keeps_its_own_slot() {
        let backend = MemcachedBackend::new(MockMemcached::new());
        let spaced = "note:has space";
        let lookalike = wire_key(spaced).into_owned();
        backend
            .set(spaced, b"spaced".to_vec(), None)
            .await
            .expect("set should succeed");
        backend
            .set(&lookalike, b"lookalike".to_vec(), None)
            .await
            .expect("set should succeed");

        assert_eq!(
            backend.get(spaced).await.expect("get should succeed"),
            Some(b"spaced".to_vec())
        );
        assert_eq!(
            backend.get(&lookalike).await.expect("get should succeed"),
            Some(b"lookalike".to_vec())
        );
    }

    #[tokio::test]
    async fn test_long_ttl_sent_absolute() {
        let backend = MemcachedBackend::new(MockMemcached::new());
        backend
            .set("k", b"v".to_vec(), Some(Duration::from_secs(MAX_RELATIVE_EXPIRY * 2)))
            .await
            .expect("set should succeed");
        let sent = backend.connection().exptime_of("k").expect("stored");
        assert!(u64::from(sent) > MAX_RELATIVE_EXPIRY);
    }

    #[tokio::test]
    async fn test_partial_batch_failure() {
        let backend = MemcachedBackend::new(MockMemcached::new());
        backend.connection().fail_key("b");
        let results = backend
            .set_many(
                vec![("a".to_string(), b"x".to_vec()), ("b".to_string(), b"y".to_vec())],
                None,
                Deadline::none(),
            )
            .await;
        assert_eq!(results[0], Ok(()));
        assert!(results[1].is_err());
        assert_eq!(
            backend.get("a").await.expect("get should succeed"),
            Some(b"x".to_vec())
        );
    }
}
