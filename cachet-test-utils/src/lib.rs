//! cachet Test Utilities
//!
//! Centralized test infrastructure for the cachet workspace:
//! - Proptest generators for values, keys and records
//! - Fixtures: sample models, registries wired to each backend
//! - Fault injection through [`FaultyBackend`]
//! - Custom assertions for cachet error kinds

// Re-export the in-process store clients from their source crate
pub use cachet_storage::{MockMemcached, MockRedis};

// Re-export core types for convenience
pub use cachet_core::{
    CacheKey, CachetConfig, CachetError, CachetResult, Field, FieldType, InsertPolicy,
    ModelConfig, ModelSchema, PrimaryKey, Record, StorageError, StorageResult, Value,
};
pub use cachet_orm::{CacheOrm, ModelHandle, ModelRegistry};
pub use cachet_storage::{CacheBackend, CacheStats, Deadline};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cachet_storage::MemoryBackend;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a fmt subscriber filtered by `RUST_LOG`, writing through the test
/// harness. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// In-memory backend that fails or stalls chosen keys.
///
/// Every operation on a failing key returns the configured error without
/// touching the store. Operations on a delayed key sleep first, which lets
/// deadline tests leave some batch items unfinished.
#[derive(Debug)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    failing: Mutex<HashMap<String, StorageError>>,
    delayed: Mutex<HashMap<String, Duration>>,
    batch_concurrency: usize,
}

impl Default for FaultyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new().with_name("faulty"),
            failing: Mutex::new(HashMap::new()),
            delayed: Mutex::new(HashMap::new()),
            batch_concurrency: cachet_storage::DEFAULT_BATCH_CONCURRENCY,
        }
    }

    pub fn with_batch_concurrency(mut self, limit: usize) -> Self {
        self.batch_concurrency = limit.max(1);
        self
    }

    /// Fail every operation on `key` with `Unavailable`.
    pub fn fail_key(&self, key: impl Into<String>) {
        let key = key.into();
        let error = StorageError::unavailable("faulty", format!("injected failure for {}", key));
        self.fail_key_with(key, error);
    }

    pub fn fail_key_with(&self, key: impl Into<String>, error: StorageError) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(key.into(), error);
        }
    }

    /// Sleep for `delay` before every operation on `key`.
    pub fn delay_key(&self, key: impl Into<String>, delay: Duration) {
        if let Ok(mut delayed) = self.delayed.lock() {
            delayed.insert(key.into(), delay);
        }
    }

    pub fn heal(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
        if let Ok(mut delayed) = self.delayed.lock() {
            delayed.clear();
        }
    }

    /// The wrapped store, for inspecting state behind the faults.
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    async fn gate(&self, key: &str) -> StorageResult<()> {
        let delay = self
            .delayed
            .lock()
            .map_err(|_| StorageError::unavailable("faulty", "lock poisoned"))?
            .get(key)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failing
            .lock()
            .map_err(|_| StorageError::unavailable("faulty", "lock poisoned"))?
            .get(key)
            .cloned();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheBackend for FaultyBackend {
    fn name(&self) -> &str {
        "faulty"
    }

    fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        self.gate(key).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.gate(key).await?;
        self.inner.get(key).await
    }

    async fn has(&self, key: &str) -> StorageResult<bool> {
        self.gate(key).await?;
        self.inner.has(key).await
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<bool> {
        self.gate(key).await?;
        self.inner.add(key, value, ttl).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.gate(key).await?;
        self.inner.replace(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.gate(key).await?;
        self.inner.delete(key).await
    }

    async fn stats(&self) -> StorageResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cachet values and records.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    /// Generate a model name (never contains the key separator).
    pub fn arb_model_name() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9_]{0,15}"
    }

    /// Generate an integer or string primary key.
    pub fn arb_primary_key() -> impl Strategy<Value = PrimaryKey> {
        prop_oneof![
            any::<i64>().prop_map(PrimaryKey::Integer),
            "[a-z0-9:_ -]{1,24}".prop_map(PrimaryKey::String),
        ]
    }

    /// Generate a finite float.
    pub fn arb_finite_f64() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(-1.5), -1.0e12f64..1.0e12f64]
    }

    /// Generate a UTC timestamp with nanosecond precision.
    pub fn arb_timestamp() -> impl Strategy<Value = chrono::DateTime<Utc>> {
        (0i64..4_102_444_800, 0u32..1_000_000_000).prop_filter_map(
            "timestamp in range",
            |(secs, nanos)| Utc.timestamp_opt(secs, nanos).single(),
        )
    }

    /// Generate a non-null value of `field_type`.
    pub fn arb_value(field_type: FieldType) -> BoxedStrategy<Value> {
        match field_type {
            FieldType::Integer => any::<i64>().prop_map(Value::Integer).boxed(),
            FieldType::Float => arb_finite_f64().prop_map(Value::Float).boxed(),
            FieldType::Boolean => any::<bool>().prop_map(Value::Boolean).boxed(),
            FieldType::String => ".{0,32}".prop_map(Value::String).boxed(),
            FieldType::Bytes => proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(Value::Bytes)
                .boxed(),
            FieldType::Timestamp => arb_timestamp().prop_map(Value::Timestamp).boxed(),
            FieldType::Enum(variants) => proptest::sample::select(variants.to_vec())
                .prop_map(Value::variant)
                .boxed(),
            FieldType::List(element) => proptest::collection::vec(arb_value(*element), 0..6)
                .prop_map(Value::List)
                .boxed(),
        }
    }

    /// Generate a record for the `User` fixture model.
    pub fn arb_user() -> impl Strategy<Value = Record> {
        (any::<i64>(), ".{0,32}")
            .prop_map(|(id, name)| Record::new().with("id", id).with("name", name))
    }

    /// Generate a record for the `Profile` fixture model, leaving nullable
    /// fields null about a third of the time.
    pub fn arb_profile() -> impl Strategy<Value = Record> {
        let schema = fixtures::profile_schema();
        let values: Vec<BoxedStrategy<(String, Value)>> = schema
            .fields()
            .iter()
            .map(|field| {
                let name = field.name().to_string();
                let value = arb_value(field.field_type().clone());
                if field.is_nullable() {
                    prop_oneof![1 => Just(Value::Null), 2 => value]
                        .prop_map(move |v| (name.clone(), v))
                        .boxed()
                } else {
                    value.prop_map(move |v| (name.clone(), v)).boxed()
                }
            })
            .collect();
        values.prop_map(|fields| fields.into_iter().collect::<Record>())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built models, records and registries.

    use super::*;
    use cachet_storage::{LmdbBackend, MemcachedBackend, RedisBackend};
    use chrono::{TimeZone, Utc};

    pub const ROLES: &[&str] = &["ADMIN", "MEMBER", "GUEST"];

    /// `User { id: integer primary key, name: string }`.
    pub fn user_schema() -> ModelSchema {
        ModelSchema::builder("User")
            .field(Field::integer("id").primary_key())
            .field(Field::string("name"))
            .build()
            .expect("user schema should build")
    }

    /// A model exercising every field type, keyed by string.
    pub fn profile_schema() -> ModelSchema {
        ModelSchema::builder("Profile")
            .field(Field::string("handle").primary_key())
            .field(Field::float("score").nullable())
            .field(Field::boolean("active").default_value(true))
            .field(Field::enumeration("role", ROLES).default_value(Value::variant("MEMBER")))
            .field(Field::bytes("avatar").nullable())
            .field(Field::list("tags", FieldType::String).default_value(Vec::<Value>::new()))
            .field(Field::list("history", FieldType::list(FieldType::Integer)).nullable())
            .field(Field::timestamp("joined_at"))
            .build()
            .expect("profile schema should build")
    }

    pub fn user(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    pub fn profile(handle: &str) -> Record {
        Record::new()
            .with("handle", handle)
            .with("score", 12.5)
            .with("role", Value::variant("ADMIN"))
            .with("avatar", vec![0u8, 7, 255])
            .with("tags", vec![Value::from("rust"), Value::from("cache")])
            .with(
                "history",
                vec![Value::List(vec![Value::Integer(1)]), Value::List(vec![])],
            )
            .with(
                "joined_at",
                Utc.with_ymd_and_hms(2023, 6, 1, 8, 0, 0)
                    .single()
                    .expect("valid date"),
            )
    }

    /// Configuration binding both fixture models to `backend` and
    /// `serializer`.
    pub fn config(backend: &str, serializer: &str) -> CachetConfig {
        CachetConfig::default()
            .with_model("User", ModelConfig::new(backend, serializer))
            .with_model("Profile", ModelConfig::new(backend, serializer))
    }

    /// Engine with `User` and `Profile` stored in `backend` through
    /// `serializer`.
    pub fn orm_with(backend: Arc<dyn CacheBackend>, serializer: &str) -> CachetResult<CacheOrm> {
        orm_with_config(backend, config("store", serializer))
    }

    /// Engine over `backend` registered as `"store"`, with fixture models
    /// bound as `config` says.
    pub fn orm_with_config(
        backend: Arc<dyn CacheBackend>,
        config: CachetConfig,
    ) -> CachetResult<CacheOrm> {
        let mut builder = ModelRegistry::builder(config)?;
        builder.register_shared_backend("store", backend)?;
        builder.register_model(user_schema())?;
        builder.register_model(profile_schema())?;
        Ok(CacheOrm::new(builder.build()))
    }

    pub fn redis_backend() -> RedisBackend<MockRedis> {
        RedisBackend::new(MockRedis::new())
    }

    pub fn memcached_backend() -> MemcachedBackend<MockMemcached> {
        MemcachedBackend::new(MockMemcached::new())
    }

    /// LMDB backend in a fresh temporary directory. Keep the directory
    /// alive for as long as the backend is used.
    pub fn lmdb_backend() -> (tempfile::TempDir, LmdbBackend) {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let backend = LmdbBackend::open(dir.path(), 16).expect("lmdb should open");
        (dir, backend)
    }

    /// Every backend kind, named, each with its own empty store. The
    /// returned guard owns the LMDB directory.
    pub fn all_backends() -> (tempfile::TempDir, Vec<(&'static str, Arc<dyn CacheBackend>)>) {
        let (dir, lmdb) = lmdb_backend();
        let memory: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let redis: Arc<dyn CacheBackend> = Arc::new(redis_backend());
        let memcached: Arc<dyn CacheBackend> = Arc::new(memcached_backend());
        let lmdb: Arc<dyn CacheBackend> = Arc::new(lmdb);
        let backends = vec![
            ("memory", memory),
            ("redis", redis),
            ("memcached", memcached),
            ("lmdb", lmdb),
        ];
        (dir, backends)
    }

    /// Names of the preset serializers.
    pub const SERIALIZERS: &[&str] = &["json", "msgpack", "bincode", "protobuf"];
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cachet error kinds.

    use super::*;

    /// Assert that a result is a `NotFound` storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    /// Assert that a result is a duplicate-key error for `key`.
    #[track_caller]
    pub fn assert_duplicate_key<T: std::fmt::Debug>(result: &CachetResult<T>, key: &str) {
        match result {
            Err(CachetError::DuplicateKey { key: k }) => {
                assert_eq!(k, key, "Wrong key in DuplicateKey error");
            }
            other => panic!("Expected DuplicateKey for {}, got: {:?}", key, other),
        }
    }

    /// Assert that a result is a transient storage error.
    #[track_caller]
    pub fn assert_transient<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(e) if e.is_transient() => {}
            other => panic!("Expected transient storage error, got: {:?}", other),
        }
    }

    /// Assert that a result is a timeout.
    #[track_caller]
    pub fn assert_timeout<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Storage(StorageError::Timeout { .. })) => {}
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    /// Assert that two sets of keys are equal regardless of order.
    #[track_caller]
    pub fn assert_same_keys<K>(actual: impl IntoIterator<Item = K>, expected: &[K])
    where
        K: std::hash::Hash + Eq + std::fmt::Debug + Clone,
    {
        let actual: HashSet<K> = actual.into_iter().collect();
        let expected: HashSet<K> = expected.iter().cloned().collect();
        assert_eq!(actual, expected);
    }
}

// ============================================================================
// TESTS
// ============================================================================
