//! Error types for cachet operations

use std::fmt;
use thiserror::Error;

use crate::FieldType;

/// Backend layer errors.
///
/// This is the only error type a cache backend may surface. Every native
/// store error is translated into one of these kinds before it crosses the
/// backend boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Connection to {backend} failed: {reason}")]
    ConnectionFailure { backend: String, reason: String },

    #[error("Operation on {backend} timed out")]
    Timeout { backend: String },

    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
}

impl StorageError {
    /// Whether a caller-side retry could succeed.
    pub fn is_transient(&self) -> bool {
        !self.is_not_found()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn connection_failure(backend: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ConnectionFailure {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(backend: impl Into<String>) -> Self {
        Self::Timeout {
            backend: backend.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}

/// Record validation errors. Raised before any I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing on {model}: {field}")]
    RequiredFieldMissing { model: String, field: String },

    #[error("Unknown field on {model}: {field}")]
    UnknownField { model: String, field: String },

    #[error("Type mismatch on {model}.{field}: expected {expected}, got {got}")]
    TypeMismatch {
        model: String,
        field: String,
        expected: FieldType,
        got: String,
    },

    #[error("Invalid value for {model}.{field}: {reason}")]
    InvalidValue {
        model: String,
        field: String,
        reason: String,
    },

    #[error("Primary key missing on {model}")]
    PrimaryKeyMissing { model: String },

    #[error("Invalid primary key for {model}: {reason}")]
    InvalidPrimaryKey { model: String, reason: String },
}

/// Encode/decode errors from a serializer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("{format} encode failed: {reason}")]
    Encode { format: String, reason: String },

    #[error("{format} decode failed: {reason}")]
    Decode { format: String, reason: String },

    #[error("{format} payload incompatible with model: {reason}")]
    SchemaMismatch { format: String, reason: String },
}

/// Errors raised while declaring a model schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Model name must not be empty")]
    EmptyName,

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Duplicate field on {model}: {field}")]
    DuplicateField { model: String, field: String },

    #[error("Model {model} declares no primary key")]
    NoPrimaryKey { model: String },

    #[error("Model {model} declares more than one primary key")]
    MultiplePrimaryKeys { model: String },

    #[error("Invalid primary key {model}.{field}: {reason}")]
    InvalidPrimaryKey {
        model: String,
        field: String,
        reason: String,
    },

    #[error("Invalid default for {model}.{field}: {reason}")]
    InvalidDefault {
        model: String,
        field: String,
        reason: String,
    },
}

/// Model/backend/serializer registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Model already registered: {name}")]
    DuplicateModel { name: String },

    #[error("Model not registered: {name}")]
    UnknownModel { name: String },

    #[error("Backend already registered: {name}")]
    DuplicateBackend { name: String },

    #[error("Backend not registered: {name}")]
    UnknownBackend { name: String },

    #[error("Serializer already registered: {name}")]
    DuplicateSerializer { name: String },

    #[error("Serializer not registered: {name}")]
    UnknownSerializer { name: String },

    #[error("No configuration for model: {name}")]
    MissingModelConfig { name: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all cachet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CachetError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Duplicate key: {key}")]
    DuplicateKey { key: String },
}

impl CachetError {
    /// True for the "update on a missing entry" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }

    /// True for errors a caller may retry (connection, timeout, unavailable).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }
}

/// Result type alias for cachet operations.
pub type CachetResult<T> = Result<T, CachetError>;

/// Result type alias for backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::not_found("user:1");
        let msg = format!("{}", err);
        assert!(msg.contains("Key not found"));
        assert!(msg.contains("user:1"));
    }

    #[test]
    fn test_storage_error_transience() {
        assert!(StorageError::timeout("redis").is_transient());
        assert!(StorageError::connection_failure("redis", "refused").is_transient());
        assert!(StorageError::unavailable("memcached", "loading").is_transient());
        assert!(!StorageError::not_found("k").is_transient());
    }

    #[test]
    fn test_validation_error_display_type_mismatch() {
        let err = ValidationError::TypeMismatch {
            model: "user".to_string(),
            field: "id".to_string(),
            expected: FieldType::Integer,
            got: "string".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("user.id"));
        assert!(msg.contains("integer"));
    }

    #[test]
    fn test_cachet_error_from_storage() {
        let err: CachetError = StorageError::not_found("user:2").into();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert!(format!("{}", err).contains("Storage error"));
    }

    #[test]
    fn test_cachet_error_duplicate_key_is_not_storage() {
        let err = CachetError::DuplicateKey {
            key: "user:1".to_string(),
        };
        assert!(!err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_serialization_error_display() {
        let err = SerializationError::Decode {
            format: "json".to_string(),
            reason: "EOF".to_string(),
        };
        assert_eq!(format!("{}", err), "json decode failed: EOF");
    }
}
