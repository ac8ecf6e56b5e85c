//! cachet Core - Data Model Types
//!
//! Pure data structures shared by every cachet crate: the error taxonomy,
//! field types and values, model schemas, records, primary and cache keys,
//! and configuration. No I/O happens here.

pub mod config;
pub mod error;
pub mod key;
pub mod record;
pub mod schema;
pub mod value;

pub use config::{normalize_ttl, CachetConfig, InsertPolicy, ModelConfig};
pub use error::{
    CachetError, CachetResult, ConfigError, RegistryError, SchemaError, SerializationError,
    StorageError, StorageResult, ValidationError,
};
pub use key::{CacheKey, PrimaryKey, KEY_SEPARATOR};
pub use record::Record;
pub use schema::{CoerceError, DefaultValue, Field, ModelSchema, ModelSchemaBuilder};
pub use value::{FieldType, Value};
