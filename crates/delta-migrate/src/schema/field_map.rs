//! Declarative field-map transformer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::EntityTransformer;
use crate::core::Row;
use crate::error::{MigrateError, Result};

/// YAML-configurable transform: copy every source field, then drop, rename
/// and add constants, then check required destination fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapRules {
    /// Source field -> destination field.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,

    /// Source fields not copied.
    #[serde(default)]
    pub drop: Vec<String>,

    /// Constant destination fields.
    #[serde(default)]
    pub constants: Map<String, Value>,

    /// Destination fields that must be present and non-null.
    #[serde(default)]
    pub required: Vec<String>,
}

/// [`EntityTransformer`] driven by a [`FieldMapRules`].
#[derive(Debug, Clone)]
pub struct FieldMapTransformer {
    entity_type: String,
    legacy_id_field: String,
    rules: FieldMapRules,
}

impl FieldMapTransformer {
    pub fn new(
        entity_type: impl Into<String>,
        legacy_id_field: impl Into<String>,
        rules: FieldMapRules,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            legacy_id_field: legacy_id_field.into(),
            rules,
        }
    }
}

impl EntityTransformer for FieldMapTransformer {
    fn transform(&self, source: &Row) -> Result<Row> {
        let mut out = Row::new();

        for (name, value) in source.fields() {
            if self.rules.drop.contains(name) {
                continue;
            }
            let target = self.rules.rename.get(name).unwrap_or(name);
            out.insert(target.clone(), value.clone());
        }

        for (name, value) in &self.rules.constants {
            out.insert(name.clone(), value.clone());
        }

        for field in &self.rules.required {
            if out.get(field).map_or(true, Value::is_null) {
                let record = source
                    .key(&self.legacy_id_field)
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string());
                return Err(MigrateError::Validation {
                    entity: self.entity_type.clone(),
                    record,
                    message: format!("required field '{}' is missing", field),
                });
            }
        }

        Ok(out)
    }
}
