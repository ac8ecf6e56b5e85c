//! Generic tagged-object serializer backed by bincode.
//!
//! Values keep their own variant tags, so decoding does not depend on type
//! hints from the schema; the schema is only checked afterwards.

use cachet_core::{ModelSchema, Record, SerializationError};

use crate::Serializer;

const FORMAT: &str = "bincode";

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn format(&self) -> &str {
        FORMAT
    }

    fn dumps(&self, schema: &ModelSchema, record: &Record) -> Result<Vec<u8>, SerializationError> {
        let record = crate::conform_for_encode(FORMAT, schema, record)?;
        bincode::serialize(&record).map_err(|e| SerializationError::Encode {
            format: FORMAT.to_string(),
            reason: e.to_string(),
        })
    }

    fn loads(&self, schema: &ModelSchema, bytes: &[u8]) -> Result<Record, SerializationError> {
        let record: Record = bincode::deserialize(bytes).map_err(|e| SerializationError::Decode {
            format: FORMAT.to_string(),
            reason: e.to_string(),
        })?;
        crate::conform_decoded(FORMAT, schema, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{person, person_schema, sparse_person};
    use cachet_core::Value;

    #[test]
    fn test_roundtrip() {
        let schema = person_schema();
        for record in [person(), sparse_person()] {
            let bytes = BincodeSerializer
                .dumps(&schema, &record)
                .expect("dumps should succeed");
            let back = BincodeSerializer
                .loads(&schema, &bytes)
                .expect("loads should succeed");
            assert_eq!(back, record);
        }
    }

    #[test]
    fn test_loads_garbage() {
        let err = BincodeSerializer
            .loads(&person_schema(), &[0xff; 3])
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));
    }

    #[test]
    fn test_loads_wrong_types() {
        // A well-formed payload whose values do not fit the schema.
        let schema = person_schema();
        let mut record = person();
        record.set("married", Value::from("yes"));
        let bytes = bincode::serialize(&record).expect("serialize");
        let err = BincodeSerializer.loads(&schema, &bytes).unwrap_err();
        assert!(matches!(err, SerializationError::SchemaMismatch { .. }));
    }
}
