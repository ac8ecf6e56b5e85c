//! Primary keys and deterministic cache keys.
//!
//! The cache key layout is `"<model_name>:<primary_key_value>"`. Model names
//! may not contain the separator (enforced when the schema is built), so the
//! first separator always splits the namespace from the key value and keys of
//! different models can never collide.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Value;

/// Separator between model name and primary key value.
pub const KEY_SEPARATOR: char = ':';

/// A primary key value. Primary keys are single-field, integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Integer(i64),
    String(String),
}

impl PrimaryKey {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for PrimaryKey {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for PrimaryKey {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<PrimaryKey> for Value {
    fn from(key: PrimaryKey) -> Self {
        match key {
            PrimaryKey::Integer(v) => Value::Integer(v),
            PrimaryKey::String(v) => Value::String(v),
        }
    }
}

impl TryFrom<Value> for PrimaryKey {
    /// Type name of the rejected value.
    type Error = &'static str;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Integer(v) => Ok(Self::Integer(v)),
            Value::String(v) => Ok(Self::String(v)),
            other => Err(other.type_name()),
        }
    }
}

/// A cache key derived from a model name and a primary key value.
///
/// The private inner data means a `CacheKey` can only be produced by
/// [`CacheKey::build`] or [`CacheKey::parse`], so every key in the system has
/// the namespaced layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    inner: String,
    model_len: usize,
}

impl CacheKey {
    /// Build the key for `(model_name, primary_key)`. Pure and total.
    pub fn build(model_name: &str, primary_key: &PrimaryKey) -> Self {
        let value = primary_key.to_string();
        let mut inner = String::with_capacity(model_name.len() + 1 + value.len());
        inner.push_str(model_name);
        inner.push(KEY_SEPARATOR);
        inner.push_str(&value);
        Self {
            inner,
            model_len: model_name.len(),
        }
    }

    /// Parse a stored key. Returns `None` when there is no separator or the
    /// model part is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let model_len = raw.find(KEY_SEPARATOR)?;
        if model_len == 0 {
            return None;
        }
        Some(Self {
            inner: raw.to_string(),
            model_len,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn into_string(self) -> String {
        self.inner
    }

    /// The namespace part of the key.
    pub fn model_name(&self) -> &str {
        &self.inner[..self.model_len]
    }

    /// The string form of the primary key value.
    pub fn key_part(&self) -> &str {
        &self.inner[self.model_len + KEY_SEPARATOR.len_utf8()..]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_layout() {
        let key = CacheKey::build("user", &PrimaryKey::Integer(1));
        assert_eq!(key.as_str(), "user:1");
        assert_eq!(key.model_name(), "user");
        assert_eq!(key.key_part(), "1");

        let key = CacheKey::build("session", &PrimaryKey::from("a:b"));
        assert_eq!(key.as_str(), "session:a:b");
        assert_eq!(key.model_name(), "session");
        assert_eq!(key.key_part(), "a:b");
    }

    #[test]
    fn test_different_models_do_not_collide() {
        let pk = PrimaryKey::Integer(1);
        assert_ne!(CacheKey::build("User", &pk), CacheKey::build("Order", &pk));
    }

    #[test]
    fn test_parse() {
        let key = CacheKey::parse("order:42").expect("valid key");
        assert_eq!(key, CacheKey::build("order", &PrimaryKey::Integer(42)));
        assert!(CacheKey::parse("no-separator").is_none());
        assert!(CacheKey::parse(":1").is_none());
    }

    #[test]
    fn test_primary_key_conversions() {
        assert_eq!(PrimaryKey::try_from(Value::Integer(5)), Ok(PrimaryKey::Integer(5)));
        assert_eq!(PrimaryKey::try_from(Value::Float(5.0)), Err("float"));
        assert_eq!(Value::from(PrimaryKey::from("x")), Value::String("x".to_string()));
    }

    #[test]
    fn test_primary_key_serde_untagged() {
        let json = serde_json::to_string(&PrimaryKey::Integer(7)).expect("serialize");
        assert_eq!(json, "7");
        let back: PrimaryKey = serde_json::from_str("\"sam\"").expect("deserialize");
        assert_eq!(back, PrimaryKey::from("sam"));
    }

    fn model_name_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z_][a-zA-Z0-9_]{0,15}"
    }

    fn primary_key_strategy() -> impl Strategy<Value = PrimaryKey> {
        prop_oneof![
            any::<i64>().prop_map(PrimaryKey::Integer),
            "[^\\s]{0,24}".prop_map(PrimaryKey::String),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Building a key twice from the same inputs yields the same key.
        #[test]
        fn prop_build_is_deterministic(
            model in model_name_strategy(),
            pk in primary_key_strategy(),
        ) {
            prop_assert_eq!(CacheKey::build(&model, &pk), CacheKey::build(&model, &pk));
        }

        /// Keys of different models never collide, whatever the key values.
        #[test]
        fn prop_models_never_collide(
            model_a in model_name_strategy(),
            model_b in model_name_strategy(),
            pk_a in primary_key_strategy(),
            pk_b in primary_key_strategy(),
        ) {
            prop_assume!(model_a != model_b);
            let a = CacheKey::build(&model_a, &pk_a);
            let b = CacheKey::build(&model_b, &pk_b);
            prop_assert_ne!(a.as_str(), b.as_str());
        }

        /// Parsing a built key recovers the namespace and key part.
        #[test]
        fn prop_parse_recovers_parts(
            model in model_name_strategy(),
            pk in primary_key_strategy(),
        ) {
            let key = CacheKey::build(&model, &pk);
            let parsed = CacheKey::parse(key.as_str());
            prop_assert_eq!(parsed.as_ref().map(CacheKey::model_name), Some(model.as_str()));
            prop_assert_eq!(parsed, Some(key));
        }
    }
}
