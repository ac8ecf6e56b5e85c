//! JSON serializer.

use cachet_core::{ModelSchema, Record, SerializationError};

use crate::wire::{self, LooseRecord, WireRecord};
use crate::Serializer;

const FORMAT: &str = "json";

/// UTF-8 JSON object, one member per field in declaration order.
///
/// Byte fields are written as arrays of integers and timestamps as RFC 3339
/// strings with nanosecond precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format(&self) -> &str {
        FORMAT
    }

    fn dumps(&self, schema: &ModelSchema, record: &Record) -> Result<Vec<u8>, SerializationError> {
        let record = crate::conform_for_encode(FORMAT, schema, record)?;
        serde_json::to_vec(&WireRecord {
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
            serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
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
    use cachet_core::Value;

    #[test]
    fn test_roundtrip_full_record() {
        let schema = person_schema();
        let record = person();
        let bytes = JsonSerializer
            .dumps(&schema, &record)
            .expect("dumps should succeed");
        let back = JsonSerializer
            .loads(&schema, &bytes)
            .expect("loads should succeed");
        assert_eq!(back, record);
    }

    #[test]
    fn test_roundtrip_sparse_record() {
        let schema = person_schema();
        let record = sparse_person();
        let bytes = JsonSerializer
            .dumps(&schema, &record)
            .expect("dumps should succeed");
        assert_eq!(
            JsonSerializer.loads(&schema, &bytes).expect("loads should succeed"),
            record
        );
    }

    #[test]
    fn test_output_is_a_plain_object() {
        let schema = person_schema();
        let bytes = JsonSerializer
            .dumps(&schema, &sparse_person())
            .expect("dumps should succeed");
        let json: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");
        assert_eq!(json["id"], 7);
        assert_eq!(json["gender"], "UNKNOWN");
        assert_eq!(json["height"], serde_json::Value::Null);
        assert_eq!(json["created_at"], "1970-01-01T00:00:00.000000000Z");
    }

    #[test]
    fn test_loads_malformed() {
        let err = JsonSerializer
            .loads(&person_schema(), b"{\"id\": 1,")
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));

        let err = JsonSerializer.loads(&person_schema(), b"[1, 2]").unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));
    }

    #[test]
    fn test_loads_schema_mismatch() {
        let schema = person_schema();
        let err = JsonSerializer
            .loads(&schema, br#"{"id": 1, "name": "x", "nickname": "y"}"#)
            .unwrap_err();
        assert!(matches!(err, SerializationError::SchemaMismatch { .. }));

        let err = JsonSerializer
            .loads(&schema, br#"{"id": "one", "name": "x"}"#)
            .unwrap_err();
        assert!(matches!(err, SerializationError::SchemaMismatch { .. }));

        // Defaults are not applied when decoding.
        let err = JsonSerializer
            .loads(
                &schema,
                br#"{"id": 1, "name": "x", "created_at": "2024-01-01T00:00:00Z"}"#,
            )
            .unwrap_err();
        assert!(matches!(err, SerializationError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_dumps_rejects_nonconforming_record() {
        let schema = person_schema();
        let record = person().with("name", Value::Integer(3));
        let err = JsonSerializer.dumps(&schema, &record).unwrap_err();
        assert!(matches!(err, SerializationError::Encode { .. }));
    }

    #[test]
    fn test_timestamp_year_bounds() {
        let schema = event_schema();
        for year in [0, 9999] {
            let record = event_in(year);
            let bytes = JsonSerializer
                .dumps(&schema, &record)
                .expect("dumps should succeed");
            assert_eq!(
                JsonSerializer.loads(&schema, &bytes).expect("loads should succeed"),
                record
            );
        }
        for year in [-1, 10000] {
            let err = JsonSerializer.dumps(&schema, &event_in(year)).unwrap_err();
            assert!(matches!(err, SerializationError::Encode { .. }), "{}", year);
        }
    }
}
