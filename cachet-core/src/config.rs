//! Configuration types

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CachetResult, ConfigError};

/// How `insert` treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPolicy {
    /// Create or overwrite (unconditional set).
    #[default]
    Upsert,
    /// Fail with a duplicate-key error when the entry already exists.
    CreateOnly,
}

/// Per-model binding: which backend and serializer, and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name of a registered backend instance.
    pub backend: String,
    /// Name of a registered serializer.
    pub serializer: String,
    /// Entry expiry for this model; falls back to `CachetConfig::default_ttl`.
    #[serde(default)]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub insert_policy: InsertPolicy,
}

impl ModelConfig {
    pub fn new(backend: impl Into<String>, serializer: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            serializer: serializer.into(),
            ttl: None,
            insert_policy: InsertPolicy::Upsert,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_insert_policy(mut self, policy: InsertPolicy) -> Self {
        self.insert_policy = policy;
        self
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachetConfig {
    /// Expiry used when a model declares none. `None` never expires.
    pub default_ttl: Option<Duration>,
    /// Maximum in-flight sub-operations of one batch call.
    pub batch_concurrency: usize,
    /// Overall deadline for one backend call.
    pub timeout: Duration,
    /// Model bindings keyed by model name.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

impl Default for CachetConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            batch_concurrency: 16,
            timeout: Duration::from_secs(5),
            models: BTreeMap::new(),
        }
    }
}

impl CachetConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CACHET_DEFAULT_TTL_SECS`: default expiry in seconds, 0 for none (default: none)
    /// - `CACHET_BATCH_CONCURRENCY`: batch fan-out limit (default: 16)
    /// - `CACHET_TIMEOUT_MS`: per-call deadline in milliseconds (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_ttl: std::env::var("CACHET_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .filter(|d| !d.is_zero())
                .or(defaults.default_ttl),
            batch_concurrency: std::env::var("CACHET_BATCH_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_concurrency),
            timeout: std::env::var("CACHET_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            models: defaults.models,
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, model: ModelConfig) -> Self {
        self.models.insert(name.into(), model);
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - batch_concurrency > 0
    /// - timeout is positive
    /// - every model names a backend and a serializer
    pub fn validate(&self) -> CachetResult<()> {
        if self.batch_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_concurrency".to_string(),
                value: self.batch_concurrency.to_string(),
                reason: "batch_concurrency must be greater than 0".to_string(),
            }
            .into());
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                value: format!("{:?}", self.timeout),
                reason: "timeout must be positive".to_string(),
            }
            .into());
        }

        for (name, model) in &self.models {
            if model.backend.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("models.{}.backend", name),
                    value: String::new(),
                    reason: "backend must be named".to_string(),
                }
                .into());
            }
            if model.serializer.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("models.{}.serializer", name),
                    value: String::new(),
                    reason: "serializer must be named".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

/// Normalize a TTL: zero means "never expires".
pub fn normalize_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|d| !d.is_zero())
}
