//! Per-entity schema descriptors.

use serde::{Deserialize, Serialize};

use crate::core::{content_hash, Predicate, RecordKey, Row, TableRef};
use crate::error::{MigrateError, Result};

/// Everything the core needs to know about one entity type.
///
/// Descriptors are resolved once when the registry is built. The core only
/// touches row fields named here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type key (e.g. "doctor").
    pub entity_type: String,

    /// Legacy table rows are read from.
    pub source_table: TableRef,

    /// Destination table rows are written to.
    pub destination_table: TableRef,

    /// Primary key field of the legacy table.
    pub legacy_id_field: String,

    /// Primary key field of the destination table (receives the mapped new id).
    #[serde(default = "default_destination_id_field")]
    pub destination_id_field: String,

    /// Destination field that receives a copy of the legacy id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_id_destination_field: Option<String>,

    /// Source-side modification timestamp used for baseline filtering.
    /// Rows without it (or with null) are always hash-compared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_field: Option<String>,

    /// Canonical hash field set. Empty means all non-volatile fields.
    #[serde(default)]
    pub hash_fields: Vec<String>,

    /// Volatile audit columns excluded from the content hash.
    #[serde(default)]
    pub volatile_fields: Vec<String>,

    /// Destination-only audit metadata never overwritten on update.
    #[serde(default)]
    pub preserved_destination_fields: Vec<String>,

    /// Predicate defining "active" source rows for deletion detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_predicate: Option<Predicate>,

    /// Entity types that must be migrated before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Scheduling priority within a wave (higher first).
    #[serde(default)]
    pub priority: i32,
}

fn default_destination_id_field() -> String {
    "id".to_string()
}

impl EntityDescriptor {
    /// Minimal descriptor; the remaining fields take their defaults.
    pub fn new(
        entity_type: impl Into<String>,
        source_table: TableRef,
        destination_table: TableRef,
        legacy_id_field: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            source_table,
            destination_table,
            legacy_id_field: legacy_id_field.into(),
            destination_id_field: default_destination_id_field(),
            legacy_id_destination_field: None,
            timestamp_field: None,
            hash_fields: Vec::new(),
            volatile_fields: Vec::new(),
            preserved_destination_fields: Vec::new(),
            active_predicate: None,
            dependencies: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_volatile_fields(mut self, fields: &[&str]) -> Self {
        self.volatile_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_preserved_destination_fields(mut self, fields: &[&str]) -> Self {
        self.preserved_destination_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_active_predicate(mut self, predicate: Predicate) -> Self {
        self.active_predicate = Some(predicate);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Fields excluded from hashing: declared volatile columns plus the
    /// modification timestamp.
    fn hash_exclusions(&self) -> Vec<String> {
        let mut excluded = self.volatile_fields.clone();
        if let Some(ts) = &self.timestamp_field {
            excluded.push(ts.clone());
        }
        excluded
    }

    /// Stable content hash of a source row.
    pub fn content_hash(&self, row: &Row) -> String {
        content_hash(row, &self.hash_fields, &self.hash_exclusions())
    }

    /// Legacy key of a source row.
    pub fn legacy_key(&self, row: &Row) -> Result<RecordKey> {
        row.key(&self.legacy_id_field).ok_or_else(|| {
            MigrateError::validation(
                &self.entity_type,
                "<unknown>",
                format!(
                    "legacy id field '{}' is missing or not a key",
                    self.legacy_id_field
                ),
            )
        })
    }

    /// Check the descriptor is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(MigrateError::Config("entity_type is required".into()));
        }
        if self.legacy_id_field.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "{}: legacy_id_field is required",
                self.entity_type
            )));
        }
        if self.destination_id_field.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "{}: destination_id_field is required",
                self.entity_type
            )));
        }
        if self.volatile_fields.contains(&self.legacy_id_field) {
            return Err(MigrateError::Config(format!(
                "{}: legacy_id_field '{}' cannot be volatile",
                self.entity_type, self.legacy_id_field
            )));
        }
        if self
            .preserved_destination_fields
            .contains(&self.destination_id_field)
        {
            return Err(MigrateError::Config(format!(
                "{}: destination_id_field '{}' cannot be preserved",
                self.entity_type, self.destination_id_field
            )));
        }
        if self.dependencies.contains(&self.entity_type) {
            return Err(MigrateError::DependencyCycle(format!(
                "{} -> {}",
                self.entity_type, self.entity_type
            )));
        }
        Ok(())
    }
}
