//! MessagePack serializer.

use cachet_core::{ModelSchema, Record, SerializationError};

use crate::wire::{self, LooseRecord, WireRecord};
use crate::Serializer;

const FORMAT: &str = "msgpack";

/// MessagePack map keyed by field name. Byte fields use the `bin` family.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn format(&self) -> &str {
        FORMAT
    }

    fn dumps(&self, schema: &ModelSchema, record: &Record) -> Result<Vec<u8>, SerializationError> {
        let record = crate::conform_for_encode(FORMAT, schema, record)?;
        rmp_serde::to_vec(&WireRecord {
            schema,
            record: &record,
        })
        .map_err(|e| SerializationError::Encode {
            format: FORMAT.to_string(),
            reason: e.to_string(),
        })
    }

    fn loads(&self, schema: &ModelSchema, bytes: &[u8]) -> Result<Record, SerializationError> {
        let raw: LooseRecord =
            rmp_serde::from_slice(bytes).map_err(|e| SerializationError::Decode {
                format: FORMAT.to_string(),
                reason: e.to_string(),
            })?;
        wire::from_loose(FORMAT, schema, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{event_in, event_schema, person, person_schema, sparse_person};

    #[test]
    fn test_roundtrip() {
        let schema = person_schema();
        for record in [person(), sparse_person()] {
            let bytes = MessagePackSerializer
                .dumps(&schema, &record)
                .expect("dumps should succeed");
            let back = MessagePackSerializer
                .loads(&schema, &bytes)
                .expect("loads should succeed");
            assert_eq!(back, record);
        }
    }

    #[test]
    fn test_smaller_than_json() {
        let schema = person_schema();
        let record = person();
        let packed = MessagePackSerializer
            .dumps(&schema, &record)
            .expect("dumps should succeed");
        let json = crate::JsonSerializer
            .dumps(&schema, &record)
            .expect("dumps should succeed");
        assert!(packed.len() < json.len());
    }

    #[test]
    fn test_loads_truncated() {
        let schema = person_schema();
        let bytes = MessagePackSerializer
            .dumps(&schema, &person())
            .expect("dumps should succeed");
        let err = MessagePackSerializer
            .loads(&schema, &bytes[..bytes.len() / 2])
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));
    }

    #[test]
    fn test_loads_from_other_model() {
        let other = cachet_core::ModelSchema::builder("tag")
            .field(cachet_core::Field::string("slug").primary_key())
            .build()
            .expect("schema should build");
        let bytes = MessagePackSerializer
            .dumps(&person_schema(), &person())
            .expect("dumps should succeed");
        let err = MessagePackSerializer.loads(&other, &bytes).unwrap_err();
        assert!(matches!(err, SerializationError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_timestamp_year_bounds() {
        let schema = event_schema();
        for year in [0, 9999] {
            let record = event_in(year);
            let bytes = MessagePackSerializer
                .dumps(&schema, &record)
                .expect("dumps should succeed");
            assert_eq!(
                MessagePackSerializer.loads(&schema, &bytes).expect("loads should succeed"),
                record
            );
        }
        for year in [-1, 10000] {
            let err = MessagePackSerializer.dumps(&schema, &event_in(year)).unwrap_err();
            assert!(matches!(err, SerializationError::Encode { .. }), "{}", year);
        }
    }
}
