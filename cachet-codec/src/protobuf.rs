//! Schema-based binary serializer using the protobuf wire format.
//!
//! The message layout is derived from the model schema: field `i` (in
//! declaration order) is tag `i + 1`. Null values are omitted. Scalars map as
//! follows:
//!
//! | field type | wire type | encoding                                    |
//! |------------|-----------|---------------------------------------------|
//! | integer    | varint    | zigzag (`sint64`)                           |
//! | float      | 64-bit    | little-endian `double`                      |
//! | boolean    | varint    | 0 / 1                                       |
//! | string     | len       | UTF-8                                       |
//! | bytes      | len       | raw                                         |
//! | timestamp  | len       | `{1: sint64 seconds, 2: uint32 nanos}`      |
//! | enum       | varint    | variant index                               |
//! | list       | len       | nested message, elements repeated at tag 1  |
//!
//! Lists are always wrapped in a nested message so that an empty list stays
//! distinguishable from an absent (null) one, and lists of lists nest.

use bytes::{Buf, BufMut};
use cachet_core::{FieldType, ModelSchema, Record, SerializationError, Value};
use chrono::{DateTime, Utc};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};

use crate::Serializer;

const FORMAT: &str = "protobuf";

/// Tag of list elements and of the seconds part of a timestamp.
const ELEMENT_TAG: u32 = 1;
const NANOS_TAG: u32 = 2;

/// Serializer bound to one model's message layout.
#[derive(Debug, Clone)]
pub struct ProtobufSerializer {
    model: String,
    layout: Vec<FieldType>,
}

impl ProtobufSerializer {
    /// Derive the message layout from `schema`.
    pub fn for_schema(schema: &ModelSchema) -> Self {
        Self {
            model: schema.name().to_string(),
            layout: schema
                .fields()
                .iter()
                .map(|f| f.field_type().clone())
                .collect(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn check_layout(&self, schema: &ModelSchema) -> Result<(), SerializationError> {
        let same = schema.name() == self.model
            && schema.fields().len() == self.layout.len()
            && schema
                .fields()
                .iter()
                .zip(&self.layout)
                .all(|(field, ty)| field.field_type() == ty);
        if same {
            Ok(())
        } else {
            Err(mismatch(format!(
                "layout was built for model {:?}, not {:?}",
                self.model,
                schema.name()
            )))
        }
    }
}

impl Serializer for ProtobufSerializer {
    fn format(&self) -> &str {
        FORMAT
    }

    fn dumps(&self, schema: &ModelSchema, record: &Record) -> Result<Vec<u8>, SerializationError> {
        self.check_layout(schema)?;
        let record = crate::conform_for_encode(FORMAT, schema, record)?;

        let mut buf = Vec::new();
        for (index, field) in schema.fields().iter().enumerate() {
            let value = record.get(field.name()).unwrap_or(&Value::Null);
            if value.is_null() {
                continue;
            }
            encode_value(tag_of(index), field.field_type(), value, &mut buf)?;
        }
        Ok(buf)
    }

    fn loads(&self, schema: &ModelSchema, bytes: &[u8]) -> Result<Record, SerializationError> {
        self.check_layout(schema)?;

        let fields = schema.fields();
        let mut slots: Vec<Option<Value>> = vec![None; fields.len()];
        let mut buf = bytes;

        while buf.has_remaining() {
            let (tag, wire_type) = decode_key(&mut buf).map_err(decode_err)?;
            let index = (tag as usize)
                .checked_sub(1)
                .filter(|i| *i < fields.len())
                .ok_or_else(|| mismatch(format!("unknown tag {}", tag)))?;
            let field = &fields[index];
            if slots[index].is_some() {
                return Err(decode_err(format!("field {:?} repeated", field.name())));
            }
            let value = decode_value(field.field_type(), wire_type, &mut buf)
                .map_err(|e| e.in_field(field.name()))?;
            slots[index] = Some(value);
        }

        let record = fields
            .iter()
            .zip(slots)
            .filter_map(|(field, slot)| slot.map(|value| (field.name().to_string(), value)))
            .collect();
        crate::conform_decoded(FORMAT, schema, record)
    }
}

fn tag_of(index: usize) -> u32 {
    (index as u32) + 1
}

fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

fn wire_type_of(field_type: &FieldType) -> WireType {
    match field_type {
        FieldType::Integer | FieldType::Boolean | FieldType::Enum(_) => WireType::Varint,
        FieldType::Float => WireType::SixtyFourBit,
        FieldType::String | FieldType::Bytes | FieldType::Timestamp | FieldType::List(_) => {
            WireType::LengthDelimited
        }
    }
}

fn encode_value(
    tag: u32,
    field_type: &FieldType,
    value: &Value,
    buf: &mut Vec<u8>,
) -> Result<(), SerializationError> {
    encode_key(tag, wire_type_of(field_type), buf);
    match (field_type, value) {
        (FieldType::Integer, Value::Integer(v)) => encode_varint(zigzag(*v), buf),
        (FieldType::Float, Value::Float(v)) => buf.put_f64_le(*v),
        (FieldType::Boolean, Value::Boolean(v)) => encode_varint(u64::from(*v), buf),
        (FieldType::String, Value::String(v)) => put_len_delimited(v.as_bytes(), buf),
        (FieldType::Bytes, Value::Bytes(v)) => put_len_delimited(v, buf),
        (FieldType::Timestamp, Value::Timestamp(v)) => {
            let mut inner = Vec::with_capacity(16);
            encode_key(ELEMENT_TAG, WireType::Varint, &mut inner);
            encode_varint(zigzag(v.timestamp()), &mut inner);
            encode_key(NANOS_TAG, WireType::Varint, &mut inner);
            encode_varint(u64::from(v.timestamp_subsec_nanos()), &mut inner);
            put_len_delimited(&inner, buf);
        }
        (FieldType::Enum(variants), Value::Enum(name)) => {
            let index = variants
                .iter()
                .position(|v| *v == name.as_str())
                .ok_or_else(|| encode_err(format!("unknown variant {:?}", name)))?;
            encode_varint(index as u64, buf);
        }
        (FieldType::List(element), Value::List(items)) => {
            let mut inner = Vec::new();
            for item in items {
                encode_value(ELEMENT_TAG, element, item, &mut inner)?;
            }
            put_len_delimited(&inner, buf);
        }
        (expected, got) => {
            return Err(encode_err(format!(
                "expected {}, got {}",
                expected,
                got.type_name()
            )));
        }
    }
    Ok(())
}

fn put_len_delimited(bytes: &[u8], buf: &mut Vec<u8>) {
    encode_varint(bytes.len() as u64, buf);
    buf.put_slice(bytes);
}

/// Failure while decoding one field; mapped to a [`SerializationError`]
/// once the field name is known.
enum FieldDecodeError {
    Malformed(String),
    Mismatch(String),
}

impl FieldDecodeError {
    fn in_field(self, name: &str) -> SerializationError {
        match self {
            Self::Malformed(reason) => decode_err(format!("field {:?}: {}", name, reason)),
            Self::Mismatch(reason) => mismatch(format!("field {:?}: {}", name, reason)),
        }
    }
}

impl From<prost::DecodeError> for FieldDecodeError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Malformed(e.to_string())
    }
}

fn decode_value(
    field_type: &FieldType,
    wire_type: WireType,
    buf: &mut &[u8],
) -> Result<Value, FieldDecodeError> {
    let expected = wire_type_of(field_type);
    if wire_type != expected {
        return Err(FieldDecodeError::Mismatch(format!(
            "expected wire type {:?} for {}, found {:?}",
            expected, field_type, wire_type
        )));
    }

    let value = match field_type {
        FieldType::Integer => Value::Integer(unzigzag(decode_varint(buf)?)),
        FieldType::Float => {
            if buf.remaining() < 8 {
                return Err(FieldDecodeError::Malformed("truncated double".to_string()));
            }
            Value::Float(buf.get_f64_le())
        }
        FieldType::Boolean => match decode_varint(buf)? {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => {
                return Err(FieldDecodeError::Malformed(format!(
                    "invalid boolean {}",
                    other
                )))
            }
        },
        FieldType::String => {
            let bytes = take_len_delimited(buf)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| FieldDecodeError::Malformed(e.to_string()))?;
            Value::String(s.to_string())
        }
        FieldType::Bytes => Value::Bytes(take_len_delimited(buf)?.to_vec()),
        FieldType::Timestamp => decode_timestamp(take_len_delimited(buf)?)?,
        FieldType::Enum(variants) => {
            let index = decode_varint(buf)?;
            let name = usize::try_from(index)
                .ok()
                .and_then(|i| variants.get(i))
                .ok_or_else(|| {
                    FieldDecodeError::Mismatch(format!("enum index {} out of range", index))
                })?;
            Value::Enum((*name).to_string())
        }
        FieldType::List(element) => {
            let mut inner = take_len_delimited(buf)?;
            let mut items = Vec::new();
            while inner.has_remaining() {
                let (tag, wire_type) = decode_key(&mut inner)?;
                if tag != ELEMENT_TAG {
                    return Err(FieldDecodeError::Malformed(format!(
                        "unexpected list tag {}",
                        tag
                    )));
                }
                items.push(decode_value(element, wire_type, &mut inner)?);
            }
            Value::List(items)
        }
    };
    Ok(value)
}

fn decode_timestamp(mut inner: &[u8]) -> Result<Value, FieldDecodeError> {
    let mut seconds = 0i64;
    let mut nanos = 0u64;
    while inner.has_remaining() {
        match decode_key(&mut inner)? {
            (ELEMENT_TAG, WireType::Varint) => seconds = unzigzag(decode_varint(&mut inner)?),
            (NANOS_TAG, WireType::Varint) => nanos = decode_varint(&mut inner)?,
            (tag, _) => {
                return Err(FieldDecodeError::Malformed(format!(
                    "unexpected timestamp tag {}",
                    tag
                )))
            }
        }
    }
    u32::try_from(nanos)
        .ok()
        .and_then(|nanos| DateTime::<Utc>::from_timestamp(seconds, nanos))
        .map(Value::Timestamp)
        .ok_or_else(|| {
            FieldDecodeError::Malformed(format!("timestamp {}.{} out of range", seconds, nanos))
        })
}

fn take_len_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], FieldDecodeError> {
    let len = decode_varint(buf)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= buf.len())
        .ok_or_else(|| FieldDecodeError::Malformed(format!("length {} exceeds buffer", len)))?;
    let slice: &'a [u8] = buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn encode_err(reason: String) -> SerializationError {
    SerializationError::Encode {
        format: FORMAT.to_string(),
        reason,
    }
}

fn decode_err(reason: impl ToString) -> SerializationError {
    SerializationError::Decode {
        format: FORMAT.to_string(),
        reason: reason.to_string(),
    }
}

fn mismatch(reason: String) -> SerializationError {
    SerializationError::SchemaMismatch {
        format: FORMAT.to_string(),
        reason,
    }
}
