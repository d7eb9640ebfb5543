//! Legacy-id to new-id identity mappings.
//!
//! A mapping is the identity of record for a migrated row. `(entity_type,
//! legacy_id)` is unique and `new_id` never changes once assigned; writes go
//! through [`crate::store::DestinationTx`] so a mapping is always committed
//! together with the destination row it describes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::core::RecordKey;
use crate::error::{MigrateError, Result};

/// Validation state of a migrated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Valid => "valid",
            ValidationStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for ValidationStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ValidationStatus::Pending),
            "valid" => Ok(ValidationStatus::Valid),
            "invalid" => Ok(ValidationStatus::Invalid),
            other => Err(MigrateError::State(format!(
                "Unknown validation status '{}'",
                other
            ))),
        }
    }
}

/// One identity mapping row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationMapping {
    pub entity_type: String,
    pub legacy_id: RecordKey,
    pub new_id: String,
    /// Content hash of the source row last written.
    pub checksum: String,
    pub validation_status: ValidationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationMapping {
    /// Mapping for a record being written now.
    ///
    /// Reuses `existing.new_id` when a mapping already exists; otherwise a
    /// fresh UUID is assigned.
    pub fn assign(
        entity_type: &str,
        legacy_id: RecordKey,
        checksum: String,
        existing: Option<&MigrationMapping>,
    ) -> Self {
        let now = Utc::now();
        match existing {
            Some(prev) => Self {
                entity_type: prev.entity_type.clone(),
                legacy_id,
                new_id: prev.new_id.clone(),
                checksum,
                validation_status: ValidationStatus::Valid,
                created_at: prev.created_at,
                updated_at: now,
            },
            None => Self {
                entity_type: entity_type.to_string(),
                legacy_id,
                new_id: uuid::Uuid::new_v4().to_string(),
                checksum,
                validation_status: ValidationStatus::Valid,
                created_at: now,
                updated_at: now,
            },
        }
    }
}

/// Read side of the mapping store.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get_mapping(
        &self,
        entity_type: &str,
        legacy_id: &RecordKey,
    ) -> Result<Option<MigrationMapping>>;

    /// Mappings for the given ids; absent ids are simply missing from the map.
    async fn get_mappings(
        &self,
        entity_type: &str,
        legacy_ids: &[RecordKey],
    ) -> Result<HashMap<RecordKey, MigrationMapping>>;

    /// One page of an entity's mappings in a stable store-defined order.
    async fn list_mappings(
        &self,
        entity_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationMapping>>;

    async fn count_mappings(&self, entity_type: &str) -> Result<u64>;
}
