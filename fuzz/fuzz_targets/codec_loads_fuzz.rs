//! Fuzz test for record decoding
//!
//! Feeds arbitrary bytes to every preset serializer. Decoding must either
//! fail with a `SerializationError` or produce a record that validates
//! against the schema and survives a second round trip.
//!
//! Run with: cargo +nightly fuzz run codec_loads_fuzz -- -max_total_time=60

#![no_main]

use cachet_codec::SerializerRegistry;
use cachet_core::{Field, FieldType, ModelSchema, Value};
use libfuzzer_sys::fuzz_target;

const KINDS: &[&str] = &["A", "B"];

fn schema() -> ModelSchema {
    ModelSchema::builder("fuzz")
        .field(Field::integer("id").primary_key())
        .field(Field::string("name"))
        .field(Field::float("ratio").nullable())
        .field(Field::boolean("flag").default_value(false))
        .field(Field::enumeration("kind", KINDS).default_value(Value::variant("A")))
        .field(Field::bytes("blob").nullable())
        .field(Field::list("nested", FieldType::list(FieldType::Integer)).nullable())
        .field(Field::timestamp("at").nullable())
        .build()
        .expect("fuzz schema should build")
}

fuzz_target!(|data: &[u8]| {
    let schema = schema();
    let registry = SerializerRegistry::with_presets();

    for name in ["json", "msgpack", "bincode", "protobuf"] {
        let serializer = registry.get(name, &schema).expect("preset is registered");

        // Decoding must never panic
        let Ok(record) = serializer.loads(&schema, data) else {
            continue;
        };

        // Anything accepted conforms to the schema
        assert!(
            schema.validate_decoded(record.clone()).is_ok(),
            "{} accepted a nonconforming record",
            name
        );

        // ...and re-encodes to the same record
        let bytes = serializer
            .dumps(&schema, &record)
            .expect("accepted record should encode");
        let again = serializer
            .loads(&schema, &bytes)
            .expect("re-encoded record should decode");
        assert_eq!(again, record, "{} round trip changed the record", name);
    }
});
