//! Entity schemas: descriptors, transformers and the provider seam.

mod descriptor;
mod field_map;
mod registry;

pub use descriptor::EntityDescriptor;
pub use field_map::{FieldMapRules, FieldMapTransformer};
pub use registry::SchemaRegistry;

use std::sync::Arc;

use crate::core::Row;
use crate::error::Result;

/// Maps one legacy row shape to one destination row shape.
///
/// Implementations return [`crate::MigrateError::Validation`] when the source
/// row does not have the shape they expect.
pub trait EntityTransformer: Send + Sync {
    fn transform(&self, source: &Row) -> Result<Row>;
}

impl<F> EntityTransformer for F
where
    F: Fn(&Row) -> Result<Row> + Send + Sync,
{
    fn transform(&self, source: &Row) -> Result<Row> {
        self(source)
    }
}

/// Identity transform: the destination row has the source row's fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl EntityTransformer for PassThrough {
    fn transform(&self, source: &Row) -> Result<Row> {
        Ok(source.clone())
    }
}

/// Looks up per-entity schema by entity-type key.
pub trait SchemaProvider: Send + Sync {
    /// Descriptor for an entity type, or `UnknownEntity`.
    fn descriptor(&self, entity_type: &str) -> Result<&EntityDescriptor>;

    /// Transformer for an entity type, or `UnknownEntity`.
    fn transformer(&self, entity_type: &str) -> Result<Arc<dyn EntityTransformer>>;

    /// All registered entity types, sorted.
    fn entity_types(&self) -> Vec<String>;
}
