//! Shared wire representation for the self-describing formats.
//!
//! Encoding writes a record as a map in schema order, with timestamps as
//! RFC 3339 strings (nanosecond precision) and enum values as variant names.
//! Decoding reads the generic serde data model ([`Loose`]) and coerces each
//! entry to the declared field type.

use std::fmt;

use cachet_core::{FieldType, ModelSchema, Record, SerializationError, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// A conforming record, borrowed for encoding.
pub(crate) struct WireRecord<'a> {
    pub schema: &'a ModelSchema,
    pub record: &'a Record,
}

impl Serialize for WireRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.schema.fields();
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for field in fields {
            let value = self.record.get(field.name()).unwrap_or(&Value::Null);
            map.serialize_entry(field.name(), &WireValue(value))?;
        }
        map.end()
    }
}

struct WireValue<'a>(&'a Value);

impl Serialize for WireValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Null => serializer.serialize_unit(),
            Value::Integer(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::String(v) | Value::Enum(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.serialize_bytes(v),
            Value::Timestamp(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&WireValue(item))?;
                }
                seq.end()
            }
        }
    }
}

/// Untyped value as read from a self-describing payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Loose {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Loose>),
}

impl Loose {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::UInt(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Seq(_) => "sequence",
        }
    }
}

impl<'de> Deserialize<'de> for Loose {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LooseVisitor)
    }
}

struct LooseVisitor;

impl<'de> Visitor<'de> for LooseVisitor {
    type Value = Loose;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar, byte string or sequence")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Loose, E> {
        Ok(Loose::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Loose, E> {
        Ok(Loose::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Loose, D::Error> {
        Loose::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Loose, E> {
        Ok(Loose::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Loose, E> {
        Ok(Loose::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Loose, E> {
        Ok(Loose::UInt(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Loose, E> {
        Ok(Loose::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Loose, E> {
        Ok(Loose::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Loose, E> {
        Ok(Loose::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Loose, E> {
        Ok(Loose::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Loose, E> {
        Ok(Loose::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Loose, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Loose::Seq(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, _map: A) -> Result<Loose, A::Error> {
        Err(de::Error::invalid_type(de::Unexpected::Map, &self))
    }
}

/// Payload shape every self-describing codec decodes into.
pub(crate) type LooseRecord = IndexMap<String, Loose>;

/// Coerce a decoded map into a record of `schema`.
pub(crate) fn from_loose(
    format: &str,
    schema: &ModelSchema,
    raw: LooseRecord,
) -> Result<Record, SerializationError> {
    let mismatch = |reason: String| SerializationError::SchemaMismatch {
        format: format.to_string(),
        reason,
    };

    let mut record = Record::with_capacity(raw.len());
    for (name, loose) in raw {
        let field = schema
            .field(&name)
            .ok_or_else(|| mismatch(format!("unknown field {:?}", name)))?;
        let value = coerce(field.field_type(), loose)
            .map_err(|reason| mismatch(format!("field {:?}: {}", name, reason)))?;
        record.set(name, value);
    }
    crate::conform_decoded(format, schema, record)
}

fn coerce(field_type: &FieldType, loose: Loose) -> Result<Value, String> {
    let value = match (field_type, loose) {
        (_, Loose::Null) => Value::Null,
        (FieldType::Integer, Loose::Int(v)) => Value::Integer(v),
        (FieldType::Integer, Loose::UInt(v)) => {
            Value::Integer(i64::try_from(v).map_err(|_| format!("{} overflows i64", v))?)
        }
        (FieldType::Float, Loose::Float(v)) => Value::Float(v),
        (FieldType::Float, Loose::Int(v)) => Value::Float(v as f64),
        (FieldType::Float, Loose::UInt(v)) => Value::Float(v as f64),
        (FieldType::Boolean, Loose::Bool(v)) => Value::Boolean(v),
        (FieldType::String, Loose::Str(v)) => Value::String(v),
        (FieldType::Bytes, Loose::Bytes(v)) => Value::Bytes(v),
        (FieldType::Bytes, Loose::Seq(items)) => Value::Bytes(
            items
                .into_iter()
                .map(|item| match item {
                    Loose::Int(b) => u8::try_from(b).ok(),
                    Loose::UInt(b) => u8::try_from(b).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| "byte array element out of range".to_string())?,
        ),
        (FieldType::Timestamp, Loose::Str(v)) => Value::Timestamp(
            DateTime::parse_from_rfc3339(&v)
                .map_err(|e| format!("bad timestamp {:?}: {}", v, e))?
                .with_timezone(&Utc),
        ),
        (FieldType::Enum(_), Loose::Str(v)) => Value::Enum(v),
        (FieldType::List(element), Loose::Seq(items)) => Value::List(
            items
                .into_iter()
                .map(|item| coerce(element, item))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (expected, other) => {
            return Err(format!("expected {}, found {}", expected, other.kind()));
        }
    };
    Ok(value)
}
