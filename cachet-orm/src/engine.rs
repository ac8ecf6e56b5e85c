//! CRUD engine.
//!
//! Every call runs validate, build key, serialize, backend call and
//! deserialize in that order. Validation and encoding failures are raised
//! before any I/O. Batch calls report one outcome per input; a failing item
//! never aborts or masks its neighbours.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cachet_core::{
    CacheKey, CachetError, CachetResult, InsertPolicy, PrimaryKey, Record, SerializationError,
    StorageError,
};
use cachet_storage::Deadline;
use tracing::{debug, warn};

use crate::registry::{Model, ModelRegistry};

/// Entry point for model operations.
#[derive(Debug, Clone)]
pub struct CacheOrm {
    registry: Arc<ModelRegistry>,
}

impl CacheOrm {
    pub fn new(registry: ModelRegistry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Handle for the operations of model `name`.
    pub fn model(&self, name: &str) -> CachetResult<ModelHandle> {
        let model = Arc::clone(self.registry.model(name)?);
        Ok(ModelHandle {
            model,
            timeout: self.registry.timeout(),
            batch_concurrency: self.registry.batch_concurrency(),
        })
    }
}

/// A record that passed validation and encoding.
struct Encoded {
    key: CacheKey,
    record: Record,
    bytes: Vec<u8>,
}

/// Operations on one model.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    model: Arc<Model>,
    timeout: Duration,
    batch_concurrency: usize,
}

impl ModelHandle {
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Cache key of a primary key value of this model.
    pub fn key_for(&self, pk: impl Into<PrimaryKey>) -> CachetResult<CacheKey> {
        let pk = pk.into();
        self.model.schema().check_primary_key(&pk)?;
        Ok(self.model.schema().key_for(&pk))
    }

    /// Store a record and return it normalized (defaults applied).
    ///
    /// Under [`InsertPolicy::Upsert`] an existing entry is overwritten. Under
    /// [`InsertPolicy::CreateOnly`] an existing entry fails the call with
    /// [`CachetError::DuplicateKey`] and is left untouched.
    pub async fn insert(&self, record: &Record) -> CachetResult<Record> {
        let Encoded { key, record, bytes } = self.encode(record)?;
        let model = &self.model;
        debug!(model = model.name(), key = %key, policy = ?model.insert_policy(), "insert");

        let backend = model.backend();
        let deadline = self.deadline();
        match model.insert_policy() {
            InsertPolicy::Upsert => {
                deadline
                    .run(backend.name(), backend.set(key.as_str(), bytes, model.ttl()))
                    .await?
            }
            InsertPolicy::CreateOnly => {
                let created = deadline
                    .run(backend.name(), backend.add(key.as_str(), bytes, model.ttl()))
                    .await?;
                if !created {
                    return Err(CachetError::DuplicateKey {
                        key: key.into_string(),
                    });
                }
            }
        }
        Ok(record)
    }

    /// Store several records with one batch call. Outcomes follow input
    /// order.
    pub async fn insert_many(&self, records: &[Record]) -> Vec<CachetResult<Record>> {
        let model = &self.model;
        let (mut results, pending) = self.encode_all(records);
        debug!(model = model.name(), count = records.len(), "insert_many");
        if pending.is_empty() {
            return results.into_iter().map(Self::settled).collect();
        }

        let (slots, records, keys, entries) = unzip_pending(pending);
        let backend = model.backend();
        let outcomes: Vec<CachetResult<()>> = match model.insert_policy() {
            InsertPolicy::Upsert => backend
                .set_many(entries, model.ttl(), self.deadline())
                .await
                .into_iter()
                .map(|r| r.map_err(CachetError::from))
                .collect(),
            InsertPolicy::CreateOnly => backend
                .add_many(entries, model.ttl(), self.deadline())
                .await
                .into_iter()
                .zip(&keys)
                .map(|(r, key)| match r {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(CachetError::DuplicateKey { key: key.clone() }),
                    Err(e) => Err(e.into()),
                })
                .collect(),
        };

        let items = slots.into_iter().zip(records).zip(&keys).zip(outcomes);
        for (((slot, record), key), outcome) in items {
            results[slot] = Some(self.item_outcome("insert_many", key, outcome.map(|()| record)));
        }
        results.into_iter().map(Self::settled).collect()
    }

    /// Read a record. `Ok(None)` is a miss.
    pub async fn get(&self, pk: impl Into<PrimaryKey>) -> CachetResult<Option<Record>> {
        let pk = pk.into();
        let key = self.key_for(pk.clone())?;
        debug!(model = self.model.name(), key = %key, "get");

        let backend = self.model.backend();
        let bytes = self
            .deadline()
            .run(backend.name(), backend.get(key.as_str()))
            .await?;
        bytes.map(|bytes| self.decode(&pk, &key, &bytes)).transpose()
    }

    /// Read a record, treating a miss as `NotFound`.
    pub async fn fetch(&self, pk: impl Into<PrimaryKey>) -> CachetResult<Record> {
        let pk = pk.into();
        match self.get(pk.clone()).await? {
            Some(record) => Ok(record),
            None => Err(StorageError::not_found(self.key_for(pk)?.into_string()).into()),
        }
    }

    /// Whether an entry exists for `pk`.
    pub async fn exists(&self, pk: impl Into<PrimaryKey>) -> CachetResult<bool> {
        let key = self.key_for(pk)?;
        debug!(model = self.model.name(), key = %key, "exists");
        let backend = self.model.backend();
        Ok(self
            .deadline()
            .run(backend.name(), backend.has(key.as_str()))
            .await?)
    }

    /// Read several records with one batch call.
    ///
    /// Misses are absent from the result. Entries that fail to decode are
    /// present as `Err`. An invalid primary key fails the whole call before
    /// any I/O, as does a backend failure.
    pub async fn get_many<K>(
        &self,
        pks: impl IntoIterator<Item = K>,
    ) -> CachetResult<HashMap<PrimaryKey, CachetResult<Record>>>
    where
        K: Into<PrimaryKey>,
    {
        let mut requested: HashMap<String, (PrimaryKey, CacheKey)> = HashMap::new();
        for pk in pks {
            let pk = pk.into();
            let key = self.key_for(pk.clone())?;
            requested.insert(key.as_str().to_string(), (pk, key));
        }
        debug!(model = self.model.name(), count = requested.len(), "get_many");

        let keys: Vec<String> = requested.keys().cloned().collect();
        let found = self
            .model
            .backend()
            .get_many(&keys, self.deadline())
            .await?;

        let mut records = HashMap::with_capacity(found.len());
        for (raw, bytes) in found {
            if let Some((pk, key)) = requested.remove(&raw) {
                let decoded = self.decode(&pk, &key, &bytes);
                if let Err(e) = &decoded {
                    warn!(
                        model = self.model.name(),
                        key = %key,
                        error = %e,
                        "get_many item failed"
                    );
                }
                records.insert(pk, decoded);
            }
        }
        Ok(records)
    }

    /// Overwrite an existing record. Never creates: a missing entry fails
    /// with `NotFound`.
    pub async fn update(&self, record: &Record) -> CachetResult<Record> {
        let Encoded { key, record, bytes } = self.encode(record)?;
        debug!(model = self.model.name(), key = %key, "update");

        let backend = self.model.backend();
        self.deadline()
            .run(
                backend.name(),
                backend.replace(key.as_str(), bytes, self.model.ttl()),
            )
            .await?;
        Ok(record)
    }

    /// Overwrite several existing records with one batch call. A missing
    /// entry is reported as `NotFound` for that item only.
    pub async fn update_many(&self, records: &[Record]) -> Vec<CachetResult<Record>> {
        let model = &self.model;
        let (mut results, pending) = self.encode_all(records);
        debug!(model = model.name(), count = records.len(), "update_many");
        if pending.is_empty() {
            return results.into_iter().map(Self::settled).collect();
        }

        let (slots, records, keys, entries) = unzip_pending(pending);
        let outcomes = model
            .backend()
            .replace_many(entries, model.ttl(), self.deadline())
            .await;

        let items = slots.into_iter().zip(records).zip(&keys).zip(outcomes);
        for (((slot, record), key), outcome) in items {
            let outcome = outcome.map(|()| record).map_err(CachetError::from);
            results[slot] = Some(self.item_outcome("update_many", key, outcome));
        }
        results.into_iter().map(Self::settled).collect()
    }

    /// Remove a record. Returns whether an entry existed.
    pub async fn delete(&self, pk: impl Into<PrimaryKey>) -> CachetResult<bool> {
        let key = self.key_for(pk)?;
        debug!(model = self.model.name(), key = %key, "delete");
        let backend = self.model.backend();
        Ok(self
            .deadline()
            .run(backend.name(), backend.delete(key.as_str()))
            .await?)
    }

    /// Remove several records with one batch call. Outcomes follow input
    /// order; an invalid primary key fails only its own item.
    pub async fn delete_many<K>(&self, pks: impl IntoIterator<Item = K>) -> Vec<CachetResult<bool>>
    where
        K: Into<PrimaryKey>,
    {
        let mut results: Vec<Option<CachetResult<bool>>> = Vec::new();
        let mut slots = Vec::new();
        let mut keys = Vec::new();
        for pk in pks {
            match self.key_for(pk) {
                Ok(key) => {
                    slots.push(results.len());
                    keys.push(key.into_string());
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }
        debug!(model = self.model.name(), count = results.len(), "delete_many");

        if !keys.is_empty() {
            let outcomes = self
                .model
                .backend()
                .delete_many(&keys, self.deadline())
                .await;
            for ((slot, key), outcome) in slots.into_iter().zip(&keys).zip(outcomes) {
                let outcome = outcome.map_err(CachetError::from);
                results[slot] = Some(self.item_outcome("delete_many", key, outcome));
            }
        }
        results.into_iter().map(Self::settled).collect()
    }

    /// Return the stored record for the key of `record`, inserting `record`
    /// first if there is none. The flag reports whether it was inserted.
    pub async fn get_or_insert(&self, record: &Record) -> CachetResult<(Record, bool)> {
        let Encoded { key, record, bytes } = self.encode(record)?;
        let pk = self.model.schema().primary_key_of(&record)?;
        debug!(model = self.model.name(), key = %key, "get_or_insert");

        let backend = self.model.backend();
        let deadline = self.deadline();
        let created = deadline
            .run(
                backend.name(),
                backend.add(key.as_str(), bytes.clone(), self.model.ttl()),
            )
            .await?;
        if created {
            return Ok((record, true));
        }

        if let Some(existing) = deadline.run(backend.name(), backend.get(key.as_str())).await? {
            return Ok((self.decode(&pk, &key, &existing)?, false));
        }

        // The entry expired or was deleted between the two calls.
        let created = deadline
            .run(
                backend.name(),
                backend.add(key.as_str(), bytes, self.model.ttl()),
            )
            .await?;
        if created {
            Ok((record, true))
        } else {
            Err(StorageError::unavailable(
                backend.name(),
                format!("{} is changing concurrently", key),
            )
            .into())
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout).with_concurrency(self.batch_concurrency)
    }

    fn encode(&self, record: &Record) -> CachetResult<Encoded> {
        let schema = self.model.schema();
        let record = schema.validate(record)?;
        let pk = schema.primary_key_of(&record)?;
        let key = schema.key_for(&pk);
        let bytes = self.model.serializer().dumps(schema, &record)?;
        Ok(Encoded { key, record, bytes })
    }

    /// Encode every record. Failures fill their result slot right away; the
    /// rest are returned with their slot index for the backend call.
    fn encode_all<T>(
        &self,
        records: &[Record],
    ) -> (Vec<Option<CachetResult<T>>>, Vec<(usize, Encoded)>) {
        let mut results = Vec::with_capacity(records.len());
        let mut pending = Vec::with_capacity(records.len());
        for (slot, record) in records.iter().enumerate() {
            match self.encode(record) {
                Ok(encoded) => {
                    pending.push((slot, encoded));
                    results.push(None);
                }
                Err(e) => {
                    warn!(model = self.model.name(), slot, error = %e, "Batch item rejected");
                    results.push(Some(Err(e)));
                }
            }
        }
        (results, pending)
    }

    fn decode(&self, pk: &PrimaryKey, key: &CacheKey, bytes: &[u8]) -> CachetResult<Record> {
        let schema = self.model.schema();
        let serializer = self.model.serializer();
        let record = serializer.loads(schema, bytes)?;
        let stored = schema.primary_key_of(&record)?;
        if stored != *pk {
            return Err(SerializationError::SchemaMismatch {
                format: serializer.format().to_string(),
                reason: format!("entry under {} holds primary key {}", key, stored),
            }
            .into());
        }
        Ok(record)
    }

    fn item_outcome<T>(&self, op: &str, key: &str, outcome: CachetResult<T>) -> CachetResult<T> {
        if let Err(e) = &outcome {
            warn!(model = self.model.name(), key, op, error = %e, "Batch item failed");
        }
        outcome
    }

    fn settled<T>(slot: Option<CachetResult<T>>) -> CachetResult<T> {
        slot.unwrap_or_else(|| {
            Err(StorageError::unavailable("cachet", "batch item produced no outcome").into())
        })
    }
}

/// Split encoded items into slot indices, normalized records, key strings
/// and backend entries.
fn unzip_pending(
    pending: Vec<(usize, Encoded)>,
) -> (Vec<usize>, Vec<Record>, Vec<String>, Vec<(String, Vec<u8>)>) {
    let mut slots = Vec::with_capacity(pending.len());
    let mut records = Vec::with_capacity(pending.len());
    let mut keys = Vec::with_capacity(pending.len());
    let mut entries = Vec::with_capacity(pending.len());
    for (slot, Encoded { key, record, bytes }) in pending {
        let key = key.into_string();
        slots.push(slot);
        records.push(record);
        keys.push(key.clone());
        entries.push((key, bytes));
    }
    (slots, records, keys, entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use cachet_core::{
        CachetConfig, Field, ModelConfig, ModelSchema, RegistryError, ValidationError, Value,
    };
    use cachet_storage::{CacheBackend, MemoryBackend};

    fn orm(policy: InsertPolicy) -> (CacheOrm, Arc<MemoryBackend>) {
        let schema = ModelSchema::builder("User")
            .field(Field::integer("id").primary_key())
            .field(Field::string("name"))
            .field(Field::boolean("active").default_value(true))
            .build()
            .expect("schema should build");
        let config = CachetConfig::default().with_model(
            "User",
            ModelConfig::new("memory", "json").with_insert_policy(policy),
        );
        let backend = Arc::new(MemoryBackend::new());
        let mut builder = RegistryBuilder::new(config).expect("config should validate");
        builder
            .register_shared_backend("memory", backend.clone())
            .expect("backend should register");
        builder.register_model(schema).expect("model should register");
        (CacheOrm::new(builder.build()), backend)
    }

    fn user(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    #[tokio::test]
    async fn test_insert_applies_defaults() {
        let (orm, _) = orm(InsertPolicy::Upsert);
        let users = orm.model("User").expect("model should resolve");
        let stored = users.insert(&user(1, "a")).await.expect("insert should succeed");
        assert_eq!(stored.get("active"), Some(&Value::Boolean(true)));
        assert_eq!(
            users.get(1).await.expect("get should succeed"),
            Some(stored)
        );
    }

    #[tokio::test]
    async fn test_validation_precedes_io() {
        let (orm, backend) = orm(InsertPolicy::Upsert);
        let users = orm.model("User").expect("model should resolve");
        let err = users
            .insert(&Record::new().with("id", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CachetError::Validation(ValidationError::RequiredFieldMissing { .. })
        ));
        assert!(backend.is_empty().expect("is_empty should succeed"));

        let err = users.get("not-an-int").await.unwrap_err();
        assert!(matches!(
            err,
            CachetError::Validation(ValidationError::InvalidPrimaryKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_only_insert() {
        let (orm, _) = orm(InsertPolicy::CreateOnly);
        let users = orm.model("User").expect("model should resolve");
        users.insert(&user(1, "a")).await.expect("insert should succeed");
        let err = users.insert(&user(1, "b")).await.unwrap_err();
        assert_eq!(
            err,
            CachetError::DuplicateKey {
                key: "User:1".to_string()
            }
        );
        let kept = users.fetch(1).await.expect("fetch should succeed");
        assert_eq!(kept.get("name"), Some(&Value::from("a")));

        let results = users.insert_many(&[user(1, "c"), user(2, "d")]).await;
        assert!(matches!(results[0], Err(CachetError::DuplicateKey { .. })));
        assert!(results[1].is_ok());
    }

    #[tokio::test]
    async fn test_fetch_and_exists() {
        let (orm, _) = orm(InsertPolicy::Upsert);
        let users = orm.model("User").expect("model should resolve");
        assert!(!users.exists(7).await.expect("exists should succeed"));
        let err = users.fetch(7).await.unwrap_err();
        assert!(err.is_not_found());

        users.insert(&user(7, "g")).await.expect("insert should succeed");
        assert!(users.exists(7).await.expect("exists should succeed"));
    }

    #[tokio::test]
    async fn test_get_or_insert() {
        let (orm, _) = orm(InsertPolicy::Upsert);
        let users = orm.model("User").expect("model should resolve");
        let (first, created) = users
            .get_or_insert(&user(3, "first"))
            .await
            .expect("get_or_insert should succeed");
        assert!(created);
        let (second, created) = users
            .get_or_insert(&user(3, "second"))
            .await
            .expect("get_or_insert should succeed");
        assert!(!created);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_primary_key_mismatch_detected() {
        let (orm, backend) = orm(InsertPolicy::Upsert);
        let users = orm.model("User").expect("model should resolve");
        users.insert(&user(1, "a")).await.expect("insert should succeed");
        let bytes = backend
            .get("User:1")
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        backend
            .set("User:2", bytes, None)
            .await
            .expect("set should succeed");

        let err = users.get(2).await.unwrap_err();
        assert!(matches!(
            err,
            CachetError::Serialization(SerializationError::SchemaMismatch { .. })
        ));

        let found = users.get_many([1, 2]).await.expect("get_many should succeed");
        assert!(found[&PrimaryKey::Integer(1)].is_ok());
        assert!(found[&PrimaryKey::Integer(2)].is_err());
    }

    #[tokio::test]
    async fn test_batch_rejects_invalid_items_only() {
        let (orm, _) = orm(InsertPolicy::Upsert);
        let users = orm.model("User").expect("model should resolve");
        let results = users
            .insert_many(&[user(1, "a"), Record::new().with("id", 2), user(3, "c")])
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CachetError::Validation(_))));
        assert!(results[2].is_ok());

        let deleted = users
            .delete_many(vec![
                PrimaryKey::from(1),
                PrimaryKey::from("x"),
                PrimaryKey::from(2),
            ])
            .await;
        assert_eq!(deleted[0], Ok(true));
        assert!(matches!(deleted[1], Err(CachetError::Validation(_))));
        assert_eq!(deleted[2], Ok(false));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let (orm, _) = orm(InsertPolicy::Upsert);
        assert!(matches!(
            orm.model("Order"),
            Err(CachetError::Registry(RegistryError::UnknownModel { .. }))
        ));
    }
}
