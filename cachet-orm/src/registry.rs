//! Model registry.
//!
//! A [`RegistryBuilder`] collects named backends, serializers and model
//! schemas during startup and resolves each model against its
//! [`ModelConfig`](cachet_core::ModelConfig). [`RegistryBuilder::build`]
//! freezes the result into a [`ModelRegistry`], which is read-only from then
//! on and is shared by reference with the CRUD engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cachet_codec::{Serializer, SerializerRegistry};
use cachet_core::{
    normalize_ttl, CachetConfig, CachetResult, InsertPolicy, ModelSchema, RegistryError,
};
use cachet_storage::CacheBackend;
use tracing::{debug, info};

/// A model bound to its backend and serializer.
#[derive(Debug)]
pub struct Model {
    schema: ModelSchema,
    backend: Arc<dyn CacheBackend>,
    serializer: Arc<dyn Serializer>,
    ttl: Option<Duration>,
    insert_policy: InsertPolicy,
}

impl Model {
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Expiry applied to every write. `None` never expires.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn insert_policy(&self) -> InsertPolicy {
        self.insert_policy
    }
}

/// Startup-time registration of backends, serializers and models.
#[derive(Debug)]
pub struct RegistryBuilder {
    config: CachetConfig,
    backends: BTreeMap<String, Arc<dyn CacheBackend>>,
    serializers: SerializerRegistry,
    models: BTreeMap<String, Arc<Model>>,
}

impl RegistryBuilder {
    /// Start from a validated configuration, with the preset serializers
    /// (`json`, `msgpack`, `bincode`, `protobuf`) already registered.
    pub fn new(config: CachetConfig) -> CachetResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backends: BTreeMap::new(),
            serializers: SerializerRegistry::with_presets(),
            models: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &CachetConfig {
        &self.config
    }

    /// Register a backend instance under `name`.
    pub fn register_backend(
        &mut self,
        name: impl Into<String>,
        backend: impl CacheBackend + 'static,
    ) -> CachetResult<()> {
        self.register_shared_backend(name, Arc::new(backend))
    }

    /// Register an already shared backend instance. Several names, or
    /// several registries, may point at the same store.
    pub fn register_shared_backend(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn CacheBackend>,
    ) -> CachetResult<()> {
        let name = name.into();
        if self.backends.contains_key(&name) {
            return Err(RegistryError::DuplicateBackend { name }.into());
        }
        debug!(backend = %name, kind = backend.name(), "Registered backend");
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Serializers available to models; register custom formats here before
    /// registering the models that use them.
    pub fn serializers_mut(&mut self) -> &mut SerializerRegistry {
        &mut self.serializers
    }

    /// Bind `schema` to the backend and serializer its configuration names.
    ///
    /// # Errors
    ///
    /// - `DuplicateModel` if a model with the same name is registered
    /// - `MissingModelConfig` if the configuration has no entry for it
    /// - `UnknownBackend` / `UnknownSerializer` for unregistered names
    pub fn register_model(&mut self, schema: ModelSchema) -> CachetResult<()> {
        let name = schema.name().to_string();
        if self.models.contains_key(&name) {
            return Err(RegistryError::DuplicateModel { name }.into());
        }
        let binding = self
            .config
            .models
            .get(&name)
            .ok_or_else(|| RegistryError::MissingModelConfig { name: name.clone() })?;
        let backend = self
            .backends
            .get(&binding.backend)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBackend {
                name: binding.backend.clone(),
            })?;
        let serializer = self.serializers.get(&binding.serializer, &schema)?;
        let ttl = normalize_ttl(binding.ttl.or(self.config.default_ttl));

        debug!(
            model = %name,
            backend = %binding.backend,
            serializer = serializer.format(),
            ?ttl,
            policy = ?binding.insert_policy,
            "Registered model"
        );
        let model = Model {
            schema,
            backend,
            serializer,
            ttl,
            insert_policy: binding.insert_policy,
        };
        self.models.insert(name, Arc::new(model));
        Ok(())
    }

    /// Freeze the registrations.
    pub fn build(self) -> ModelRegistry {
        info!(
            models = self.models.len(),
            backends = self.backends.len(),
            batch_concurrency = self.config.batch_concurrency,
            "Model registry initialized"
        );
        ModelRegistry {
            models: self.models,
            backends: self.backends,
            timeout: self.config.timeout,
            batch_concurrency: self.config.batch_concurrency,
        }
    }
}

/// Read-only registry of bound models.
#[derive(Debug)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<Model>>,
    backends: BTreeMap<String, Arc<dyn CacheBackend>>,
    timeout: Duration,
    batch_concurrency: usize,
}

impl ModelRegistry {
    pub fn builder(config: CachetConfig) -> CachetResult<RegistryBuilder> {
        RegistryBuilder::new(config)
    }

    pub fn model(&self, name: &str) -> CachetResult<&Arc<Model>> {
        self.models.get(name).ok_or_else(|| {
            RegistryError::UnknownModel {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn backend(&self, name: &str) -> CachetResult<&Arc<dyn CacheBackend>> {
        self.backends.get(name).ok_or_else(|| {
            RegistryError::UnknownBackend {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Registered model names in sorted order.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Deadline applied to every backend call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upper bound on in-flight sub-operations of one batch call.
    pub fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }
}
