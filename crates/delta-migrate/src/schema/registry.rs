//! In-process schema registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{EntityDescriptor, EntityTransformer, FieldMapTransformer, SchemaProvider};
use crate::config::EntityConfig;
use crate::error::{MigrateError, Result};

struct Registered {
    descriptor: EntityDescriptor,
    transformer: Arc<dyn EntityTransformer>,
}

/// [`SchemaProvider`] backed by descriptors registered at startup.
#[derive(Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Registered>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. The descriptor is validated here, once.
    pub fn register(
        &mut self,
        descriptor: EntityDescriptor,
        transformer: Arc<dyn EntityTransformer>,
    ) -> Result<()> {
        descriptor.validate()?;
        if self.entities.contains_key(&descriptor.entity_type) {
            return Err(MigrateError::Config(format!(
                "Entity type '{}' registered twice",
                descriptor.entity_type
            )));
        }
        self.entities.insert(
            descriptor.entity_type.clone(),
            Registered {
                descriptor,
                transformer,
            },
        );
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_entity(
        mut self,
        descriptor: EntityDescriptor,
        transformer: Arc<dyn EntityTransformer>,
    ) -> Result<Self> {
        self.register(descriptor, transformer)?;
        Ok(self)
    }

    /// Build a registry from declarative config entries, one
    /// [`FieldMapTransformer`] per entity.
    pub fn from_config(entities: &[EntityConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for entity in entities {
            let descriptor = entity.descriptor.clone();
            let transformer = FieldMapTransformer::new(
                descriptor.entity_type.clone(),
                descriptor.legacy_id_field.clone(),
                entity.transform.clone(),
            );
            registry.register(descriptor, Arc::new(transformer))?;
        }
        registry.check_dependencies()?;
        Ok(registry)
    }

    /// Every declared dependency must name a registered entity type.
    pub fn check_dependencies(&self) -> Result<()> {
        for (name, entry) in &self.entities {
            for dep in &entry.descriptor.dependencies {
                if !self.entities.contains_key(dep) {
                    return Err(MigrateError::Config(format!(
                        "Entity '{}' depends on unregistered entity '{}'",
                        name, dep
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl SchemaProvider for SchemaRegistry {
    fn descriptor(&self, entity_type: &str) -> Result<&EntityDescriptor> {
        self.entities
            .get(entity_type)
            .map(|e| &e.descriptor)
            .ok_or_else(|| MigrateError::UnknownEntity(entity_type.to_string()))
    }

    fn transformer(&self, entity_type: &str) -> Result<Arc<dyn EntityTransformer>> {
        self.entities
            .get(entity_type)
            .map(|e| Arc::clone(&e.transformer))
            .ok_or_else(|| MigrateError::UnknownEntity(entity_type.to_string()))
    }

    fn entity_types(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .finish()
    }
}
