//! Model schemas: field descriptors, primary key, and record validation.
//!
//! A [`ModelSchema`] is built once with [`ModelSchemaBuilder`] and is
//! immutable afterwards. Records are validated against it before any I/O.

use std::fmt;

use chrono::Datelike;

use crate::{CacheKey, FieldType, PrimaryKey, Record, SchemaError, ValidationError, Value};

/// Years representable as an RFC 3339 timestamp.
const TIMESTAMP_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

/// Default-value rule for a field.
#[derive(Debug, Clone)]
pub enum DefaultValue {
    /// A fixed value.
    Static(Value),
    /// Evaluated each time a record is validated (e.g. "now").
    Factory(fn() -> Value),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            Self::Static(value) => value.clone(),
            Self::Factory(f) => f(),
        }
    }
}

/// One named, typed attribute of a model.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    field_type: FieldType,
    nullable: bool,
    primary_key: bool,
    default: Option<DefaultValue>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            primary_key: false,
            default: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bytes)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp)
    }

    pub fn enumeration(name: impl Into<String>, variants: &'static [&'static str]) -> Self {
        Self::new(name, FieldType::Enum(variants))
    }

    pub fn list(name: impl Into<String>, element: FieldType) -> Self {
        Self::new(name, FieldType::list(element))
    }

    /// Mark this field as the model's primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allow the field to be absent or null.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }

    pub fn default_with(mut self, factory: fn() -> Value) -> Self {
        self.default = Some(DefaultValue::Factory(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    /// A field is required when it is neither nullable nor defaulted.
    pub fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }

    pub fn default(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }
}

/// Why a value does not fit a [`FieldType`].
#[derive(Debug, Clone, PartialEq)]
pub enum CoerceError {
    Mismatch { got: &'static str },
    Invalid(String),
}

impl fmt::Display for CoerceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { got } => write!(f, "unexpected {}", got),
            Self::Invalid(reason) => f.write_str(reason),
        }
    }
}

impl FieldType {
    /// Check `value` against this type, converting where lossless
    /// (integer into float, string into enum variant).
    pub fn coerce(&self, value: Value) -> Result<Value, CoerceError> {
        match (self, value) {
            (Self::Integer, v @ Value::Integer(_)) => Ok(v),
            (Self::Float, Value::Float(f)) if f.is_finite() => Ok(Value::Float(f)),
            (Self::Float, Value::Float(f)) => {
                Err(CoerceError::Invalid(format!("non-finite float {}", f)))
            }
            (Self::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (Self::Boolean, v @ Value::Boolean(_)) => Ok(v),
            (Self::String, v @ Value::String(_)) => Ok(v),
            (Self::Bytes, v @ Value::Bytes(_)) => Ok(v),
            (Self::Timestamp, Value::Timestamp(t)) if TIMESTAMP_YEARS.contains(&t.year()) => {
                Ok(Value::Timestamp(t))
            }
            (Self::Timestamp, Value::Timestamp(t)) => Err(CoerceError::Invalid(format!(
                "timestamp year {} outside {}..={}",
                t.year(),
                TIMESTAMP_YEARS.start(),
                TIMESTAMP_YEARS.end()
            ))),
            (Self::Enum(variants), Value::Enum(name) | Value::String(name)) => {
                if variants.contains(&name.as_str()) {
                    Ok(Value::Enum(name))
                } else {
                    Err(CoerceError::Invalid(format!("unknown variant {:?}", name)))
                }
            }
            (Self::List(element), Value::List(items)) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    if item.is_null() {
                        return Err(CoerceError::Invalid(format!("element {} is null", i)));
                    }
                    element
                        .coerce(item)
                        .map_err(|e| CoerceError::Invalid(format!("element {}: {}", i, e)))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            (_, other) => Err(CoerceError::Mismatch {
                got: other.type_name(),
            }),
        }
    }
}

/// Immutable description of a model: name, fields, primary key.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    name: String,
    fields: Vec<Field>,
    primary_key: usize,
}

impl ModelSchema {
    pub fn builder(name: impl Into<String>) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn primary_key(&self) -> &Field {
        &self.fields[self.primary_key]
    }

    /// Validate a caller-supplied record.
    ///
    /// Returns the normalized record in declaration order: defaults applied,
    /// absent nullable fields set to [`Value::Null`], values coerced.
    pub fn validate(&self, record: &Record) -> Result<Record, ValidationError> {
        self.conform(record.clone(), true)
    }

    /// Validate a record produced by a decoder. Defaults are never applied:
    /// a missing non-nullable field is an error.
    pub fn validate_decoded(&self, record: Record) -> Result<Record, ValidationError> {
        self.conform(record, false)
    }

    fn conform(&self, mut record: Record, apply_defaults: bool) -> Result<Record, ValidationError> {
        let mut out = Record::with_capacity(self.fields.len());

        for field in &self.fields {
            let value = match record.remove(&field.name) {
                Some(Value::Null) | None if field.primary_key => {
                    return Err(ValidationError::PrimaryKeyMissing {
                        model: self.name.clone(),
                    })
                }
                Some(Value::Null) if field.nullable => Value::Null,
                Some(Value::Null) => {
                    return Err(ValidationError::InvalidValue {
                        model: self.name.clone(),
                        field: field.name.clone(),
                        reason: "null is not allowed".to_string(),
                    })
                }
                Some(value) => value,
                None => match (&field.default, apply_defaults) {
                    (Some(default), true) => default.produce(),
                    _ if field.nullable => Value::Null,
                    _ => {
                        return Err(ValidationError::RequiredFieldMissing {
                            model: self.name.clone(),
                            field: field.name.clone(),
                        })
                    }
                },
            };

            let value = if value.is_null() {
                value
            } else {
                field.field_type.coerce(value).map_err(|e| match e {
                    CoerceError::Mismatch { got } => ValidationError::TypeMismatch {
                        model: self.name.clone(),
                        field: field.name.clone(),
                        expected: field.field_type.clone(),
                        got: got.to_string(),
                    },
                    CoerceError::Invalid(reason) => ValidationError::InvalidValue {
                        model: self.name.clone(),
                        field: field.name.clone(),
                        reason,
                    },
                })?
            };
            out.set(field.name.clone(), value);
        }

        if let Some(unknown) = record.field_names().next() {
            return Err(ValidationError::UnknownField {
                model: self.name.clone(),
                field: unknown.to_string(),
            });
        }

        Ok(out)
    }

    /// Extract the primary key of an already-validated record.
    pub fn primary_key_of(&self, record: &Record) -> Result<PrimaryKey, ValidationError> {
        let pk = self.primary_key();
        match record.get(&pk.name) {
            None | Some(Value::Null) => Err(ValidationError::PrimaryKeyMissing {
                model: self.name.clone(),
            }),
            Some(value) => {
                let key = PrimaryKey::try_from(value.clone()).map_err(|got| {
                    ValidationError::TypeMismatch {
                        model: self.name.clone(),
                        field: pk.name.clone(),
                        expected: pk.field_type.clone(),
                        got: got.to_string(),
                    }
                })?;
                self.check_primary_key(&key)?;
                Ok(key)
            }
        }
    }

    /// Ensure a lookup key matches the declared primary key type.
    pub fn check_primary_key(&self, key: &PrimaryKey) -> Result<(), ValidationError> {
        let matches = matches!(
            (&self.primary_key().field_type, key),
            (FieldType::Integer, PrimaryKey::Integer(_))
                | (FieldType::String, PrimaryKey::String(_))
        );
        if matches {
            Ok(())
        } else {
            Err(ValidationError::InvalidPrimaryKey {
                model: self.name.clone(),
                reason: format!(
                    "expected {} key, got {}",
                    self.primary_key().field_type,
                    key.type_name()
                ),
            })
        }
    }

    /// Cache key for a primary key value of this model.
    pub fn key_for(&self, key: &PrimaryKey) -> CacheKey {
        CacheKey::build(&self.name, key)
    }
}

/// Builder for [`ModelSchema`].
#[derive(Debug)]
pub struct ModelSchemaBuilder {
    name: String,
    fields: Vec<Field>,
}

impl ModelSchemaBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Check the declaration and freeze it.
    ///
    /// # Errors
    ///
    /// - empty model name, or one containing the key separator or whitespace
    /// - empty or duplicate field names
    /// - zero or several primary keys
    /// - a primary key that is not integer/string, is nullable, or has a default
    /// - a static default that does not fit its field type
    pub fn build(self) -> Result<ModelSchema, SchemaError> {
        if self.name.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        check_name(&self.name)?;

        let mut primary_key = None;
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(SchemaError::InvalidName {
                    name: field.name.clone(),
                    reason: "field name must not be empty".to_string(),
                });
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    model: self.name.clone(),
                    field: field.name.clone(),
                });
            }

            if field.primary_key {
                if primary_key.is_some() {
                    return Err(SchemaError::MultiplePrimaryKeys {
                        model: self.name.clone(),
                    });
                }
                let reason = if !field.field_type.is_key_type() {
                    Some(format!("{} cannot be a key type", field.field_type))
                } else if field.nullable {
                    Some("primary key cannot be nullable".to_string())
                } else if field.default.is_some() {
                    Some("primary key cannot have a default".to_string())
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(SchemaError::InvalidPrimaryKey {
                        model: self.name.clone(),
                        field: field.name.clone(),
                        reason,
                    });
                }
                primary_key = Some(i);
            }

            if let Some(DefaultValue::Static(value)) = &field.default {
                if !(value.is_null() && field.nullable) {
                    field.field_type.coerce(value.clone()).map_err(|e| {
                        SchemaError::InvalidDefault {
                            model: self.name.clone(),
                            field: field.name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
            }
        }

        let primary_key = primary_key.ok_or_else(|| SchemaError::NoPrimaryKey {
            model: self.name.clone(),
        })?;

        Ok(ModelSchema {
            name: self.name,
            fields: self.fields,
            primary_key,
        })
    }
}

fn check_name(name: &str) -> Result<(), SchemaError> {
    let reason = if name.contains(crate::KEY_SEPARATOR) {
        Some(format!("must not contain {:?}", crate::KEY_SEPARATOR))
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("must not contain whitespace or control characters".to_string())
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SchemaError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const GENDERS: &[&str] = &["UNKNOWN", "MALE", "FEMALE"];

    fn user_schema() -> ModelSchema {
        ModelSchema::builder("user")
            .field(Field::integer("id").primary_key())
            .field(Field::string("name"))
            .field(Field::float("height").nullable())
            .field(Field::boolean("married").default_value(false))
            .field(Field::enumeration("gender", GENDERS).default_value(Value::variant("UNKNOWN")))
            .field(Field::list("tags", FieldType::String).default_value(Vec::<Value>::new()))
            .field(Field::timestamp("created_at").default_with(|| Value::Timestamp(Utc::now())))
            .build()
            .expect("user schema should build")
    }

    #[test]
    fn test_build_requires_primary_key() {
        let err = ModelSchema::builder("note")
            .field(Field::string("content"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::NoPrimaryKey {
                model: "note".to_string()
            }
        );
    }

    #[test]
    fn test_build_rejects_over_determined_primary_key() {
        let err = ModelSchema::builder("note")
            .field(Field::integer("id").primary_key())
            .field(Field::string("slug").primary_key())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::MultiplePrimaryKeys { .. }));
    }

    #[test]
    fn test_build_rejects_bad_primary_key_type() {
        let err = ModelSchema::builder("note")
            .field(Field::float("id").primary_key())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPrimaryKey { .. }));

        let err = ModelSchema::builder("note")
            .field(Field::integer("id").primary_key().nullable())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPrimaryKey { .. }));
    }

    #[test]
    fn test_build_rejects_separator_in_name() {
        let err = ModelSchema::builder("a:b")
            .field(Field::integer("id").primary_key())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidName { .. }));
    }

    #[test]
    fn test_build_rejects_duplicate_field() {
        let err = ModelSchema::builder("user")
            .field(Field::integer("id").primary_key())
            .field(Field::string("name"))
            .field(Field::string("name"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));
    }

    #[test]
    fn test_build_rejects_bad_default() {
        let err = ModelSchema::builder("user")
            .field(Field::integer("id").primary_key())
            .field(Field::boolean("married").default_value("yes"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefault { .. }));
    }

    #[test]
    fn test_validate_applies_defaults_and_nulls() {
        let schema = user_schema();
        let record = Record::new().with("id", 1).with("name", "Sam");
        let normalized = schema.validate(&record).expect("valid record");

        assert_eq!(normalized.get("height"), Some(&Value::Null));
        assert_eq!(normalized.get("married"), Some(&Value::Boolean(false)));
        assert_eq!(normalized.get("gender"), Some(&Value::variant("UNKNOWN")));
        assert_eq!(normalized.get("tags"), Some(&Value::List(vec![])));
        assert!(normalized.get("created_at").and_then(Value::as_timestamp).is_some());
        assert_eq!(
            normalized.field_names().collect::<Vec<_>>(),
            vec!["id", "name", "height", "married", "gender", "tags", "created_at"]
        );
    }

    #[test]
    fn test_validate_missing_required_field() {
        let schema = user_schema();
        let err = schema.validate(&Record::new().with("id", 1)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::RequiredFieldMissing {
                model: "user".to_string(),
                field: "name".to_string()
            }
        );
    }

    #[test]
    fn test_validate_missing_primary_key() {
        let schema = user_schema();
        let err = schema
            .validate(&Record::new().with("name", "Sam"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::PrimaryKeyMissing { .. }));
    }

    #[test]
    fn test_validate_type_mismatch_and_unknown_field() {
        let schema = user_schema();
        let err = schema
            .validate(&Record::new().with("id", "one").with("name", "Sam"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));

        let err = schema
            .validate(&Record::new().with("id", 1).with("name", "Sam").with("age", 3))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownField {
                model: "user".to_string(),
                field: "age".to_string()
            }
        );
    }

    #[test]
    fn test_validate_coercions() {
        let schema = user_schema();
        let record = Record::new()
            .with("id", 3)
            .with("name", "Daming")
            .with("height", 180)
            .with("gender", "MALE");
        let normalized = schema.validate(&record).expect("valid record");
        assert_eq!(normalized.get("height"), Some(&Value::Float(180.0)));
        assert_eq!(normalized.get("gender"), Some(&Value::variant("MALE")));

        let err = schema
            .validate(&Record::new().with("id", 3).with("name", "x").with("gender", "ROBOT"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));

        let err = schema
            .validate(&Record::new().with("id", 3).with("name", "x").with("height", f64::NAN))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_decoded_skips_defaults() {
        let schema = user_schema();
        let err = schema
            .validate_decoded(Record::new().with("id", 1).with("name", "Sam"))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::RequiredFieldMissing {
                model: "user".to_string(),
                field: "married".to_string()
            }
        );
    }

    #[test]
    fn test_list_element_checks() {
        let ty = FieldType::list(FieldType::Integer);
        assert!(ty.coerce(Value::List(vec![Value::Integer(1)])).is_ok());
        assert!(ty.coerce(Value::List(vec![Value::Null])).is_err());
        assert!(ty.coerce(Value::List(vec![Value::from("x")])).is_err());
        assert!(matches!(
            ty.coerce(Value::Integer(1)),
            Err(CoerceError::Mismatch { got: "integer" })
        ));
    }

    #[test]
    fn test_timestamp_year_range() {
        let at = |year| {
            Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
                .single()
                .expect("valid date")
        };
        for year in [0, 1970, 9999] {
            assert!(FieldType::Timestamp.coerce(Value::Timestamp(at(year))).is_ok());
        }
        for year in [-1, 10000] {
            assert!(matches!(
                FieldType::Timestamp.coerce(Value::Timestamp(at(year))),
                Err(CoerceError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_primary_key_checks() {
        let schema = user_schema();
        assert!(schema.check_primary_key(&PrimaryKey::Integer(1)).is_ok());
        assert!(matches!(
            schema.check_primary_key(&PrimaryKey::from("1")),
            Err(ValidationError::InvalidPrimaryKey { .. })
        ));

        let record = schema
            .validate(&Record::new().with("id", 9).with("name", "Sam"))
            .expect("valid record");
        assert_eq!(schema.primary_key_of(&record), Ok(PrimaryKey::Integer(9)));
        assert_eq!(schema.key_for(&PrimaryKey::Integer(9)).as_str(), "user:9");
    }
}
