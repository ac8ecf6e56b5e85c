//! Named serializer registry.
//!
//! Models refer to serializers by name. Self-describing formats are shared
//! across models, while schema-based ones are instantiated per model, so the
//! registry stores factories that receive the model schema.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cachet_core::{ModelSchema, RegistryError};
use tracing::debug;

use crate::{
    BincodeSerializer, JsonSerializer, MessagePackSerializer, ProtobufSerializer, Serializer,
};

/// Builds the serializer a model will use.
pub type SerializerFactory = Arc<dyn Fn(&ModelSchema) -> Arc<dyn Serializer> + Send + Sync>;

/// Serializer lookup by name.
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    factories: BTreeMap<String, SerializerFactory>,
}

impl SerializerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in formats: `json`, `msgpack`, `bincode`
    /// and `protobuf`.
    pub fn with_presets() -> Self {
        let mut registry = Self::new();
        registry.insert_shared("json", Arc::new(JsonSerializer));
        registry.insert_shared("msgpack", Arc::new(MessagePackSerializer));
        registry.insert_shared("bincode", Arc::new(BincodeSerializer));
        registry.factories.insert(
            "protobuf".to_string(),
            Arc::new(|schema: &ModelSchema| {
                Arc::new(ProtobufSerializer::for_schema(schema)) as Arc<dyn Serializer>
            }),
        );
        registry
    }

    /// Register a factory under `name`.
    ///
    /// # Errors
    ///
    /// `DuplicateSerializer` if the name is taken.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&ModelSchema) -> Arc<dyn Serializer> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::DuplicateSerializer { name });
        }
        debug!(serializer = %name, "Registered serializer");
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Register one serializer instance shared by every model.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<(), RegistryError> {
        self.register(name, move |_: &ModelSchema| Arc::clone(&serializer))
    }

    /// Remove a registration.
    ///
    /// # Errors
    ///
    /// `UnknownSerializer` if nothing is registered under `name`.
    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.factories.remove(name).is_none() {
            return Err(RegistryError::UnknownSerializer {
                name: name.to_string(),
            });
        }
        debug!(serializer = %name, "Unregistered serializer");
        Ok(())
    }

    /// Instantiate the serializer `name` for `schema`.
    pub fn get(
        &self,
        name: &str,
        schema: &ModelSchema,
    ) -> Result<Arc<dyn Serializer>, RegistryError> {
        self.factories
            .get(name)
            .map(|factory| factory(schema))
            .ok_or_else(|| RegistryError::UnknownSerializer {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn insert_shared(&mut self, name: &str, serializer: Arc<dyn Serializer>) {
        self.factories.insert(
            name.to_string(),
            Arc::new(move |_: &ModelSchema| Arc::clone(&serializer)),
        );
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
