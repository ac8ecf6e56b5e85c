//! cachet Codec - Record Serializers
//!
//! A [`Serializer`] turns a [`Record`] into bytes and back for one wire
//! format. Two families are provided:
//!
//! - self-describing: [`JsonSerializer`], [`MessagePackSerializer`] and the
//!   generic tagged-object [`BincodeSerializer`]. Decoding only needs the
//!   target schema for type coercion.
//! - schema-based: [`ProtobufSerializer`], a compact protobuf-wire message
//!   whose field layout is fixed ahead of time from the model schema.
//!
//! Every codec obeys the round-trip law `loads(dumps(r)) == r` for records
//! that validate against the schema, and rejects bytes that do not fit the
//! schema with a [`SerializationError`] instead of producing partial data.
//!
//! The bincode format mirrors Rust's own value representation; it is not
//! meant to be byte-compatible with other runtimes. JSON, MessagePack and
//! protobuf-wire payloads are portable.

pub mod bincode_codec;
pub mod json;
pub mod msgpack;
pub mod protobuf;
pub mod registry;
mod wire;

pub use bincode_codec::BincodeSerializer;
pub use json::JsonSerializer;
pub use msgpack::MessagePackSerializer;
pub use protobuf::ProtobufSerializer;
pub use registry::{SerializerFactory, SerializerRegistry};

use std::fmt;

use cachet_core::{ModelSchema, Record, SerializationError};

/// Serializer trait for pluggable wire formats.
///
/// Implementations must be thread-safe: one instance is shared by every
/// caller of a model.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Short format name used in errors and logs.
    fn format(&self) -> &str;

    /// Encode a record of `schema`.
    fn dumps(&self, schema: &ModelSchema, record: &Record) -> Result<Vec<u8>, SerializationError>;

    /// Decode bytes into a record of `schema`.
    fn loads(&self, schema: &ModelSchema, bytes: &[u8]) -> Result<Record, SerializationError>;
}

/// Check that a record fits its schema before encoding.
pub(crate) fn conform_for_encode(
    format: &str,
    schema: &ModelSchema,
    record: &Record,
) -> Result<Record, SerializationError> {
    schema
        .validate_decoded(record.clone())
        .map_err(|e| SerializationError::Encode {
            format: format.to_string(),
            reason: e.to_string(),
        })
}

/// Check that a decoded record fits its schema.
pub(crate) fn conform_decoded(
    format: &str,
    schema: &ModelSchema,
    record: Record,
) -> Result<Record, SerializationError> {
    schema
        .validate_decoded(record)
        .map_err(|e| SerializationError::SchemaMismatch {
            format: format.to_string(),
            reason: e.to_string(),
        })
}
