//! cachet ORM - Model Registry and CRUD Engine
//!
//! Maps typed records onto cache entries. A model's schema, backend,
//! serializer and expiry are bound once in a [`ModelRegistry`]; the
//! [`CacheOrm`] engine then serves per-model [`ModelHandle`]s:
//!
//! ```ignore
//! let mut builder = ModelRegistry::builder(config)?;
//! builder.register_backend("memory", MemoryBackend::new())?;
//! builder.register_model(user_schema)?;
//! let orm = CacheOrm::new(builder.build());
//!
//! let users = orm.model("User")?;
//! users.insert(&Record::new().with("id", 1).with("name", "a")).await?;
//! let user = users.get(1).await?;
//! ```
//!
//! Entries live under `"<model>:<primary key>"`. `insert` follows the
//! model's [`InsertPolicy`](cachet_core::InsertPolicy); `update` only ever
//! overwrites an existing entry.

pub mod engine;
pub mod registry;

pub use engine::{CacheOrm, ModelHandle};
pub use registry::{Model, ModelRegistry, RegistryBuilder};

pub use cachet_core::{
    CacheKey, CachetConfig, CachetError, CachetResult, Field, FieldType, InsertPolicy,
    ModelConfig, ModelSchema, PrimaryKey, Record, Value,
};
