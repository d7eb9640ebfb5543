//! Migration tasks built from detection results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ChangeType, DetectionResult};
use crate::core::key::encoded_map;
use crate::core::RecordKey;
use crate::error::Result;
use crate::schema::SchemaProvider;

/// Rough per-record cost used for duration estimates.
const ESTIMATED_MS_PER_RECORD: u64 = 2;

/// One entity's share of a run: which records to apply, in which order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub entity_type: String,
    /// Record ids in ascending key order.
    pub record_ids: Vec<RecordKey>,
    /// Change type observed at detection time, per record.
    #[serde(with = "encoded_map", default)]
    pub change_hints: BTreeMap<RecordKey, ChangeType>,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub estimated_duration_ms: u64,
}

impl MigrationTask {
    /// Task over explicit ids, without change hints.
    pub fn new(entity_type: impl Into<String>, mut record_ids: Vec<RecordKey>) -> Self {
        record_ids.sort();
        record_ids.dedup();
        let estimated_duration_ms = record_ids.len() as u64 * ESTIMATED_MS_PER_RECORD;
        Self {
            entity_type: entity_type.into(),
            record_ids,
            change_hints: BTreeMap::new(),
            priority: 0,
            dependencies: Vec::new(),
            estimated_duration_ms,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Build the task for one detection result.
    pub fn from_detection(result: &DetectionResult, schema: &dyn SchemaProvider) -> Result<Self> {
        let descriptor = schema.descriptor(&result.entity_type)?;
        let mut task = Self::new(
            result.entity_type.clone(),
            result
                .changes_detected
                .iter()
                .map(|c| c.record_id.clone())
                .collect(),
        );
        task.change_hints = result
            .changes_detected
            .iter()
            .map(|c| (c.record_id.clone(), c.change_type))
            .collect();
        task.priority = descriptor.priority;
        task.dependencies = descriptor.dependencies.clone();
        Ok(task)
    }

    pub fn hint(&self, id: &RecordKey) -> Option<ChangeType> {
        self.change_hints.get(id).copied()
    }

    /// Ids strictly after `key`, preserving order.
    pub fn ids_after(&self, key: Option<&RecordKey>) -> &[RecordKey] {
        match key {
            None => &self.record_ids,
            Some(k) => {
                let start = self.record_ids.partition_point(|id| id <= k);
                &self.record_ids[start..]
            }
        }
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }
}

/// One task per entity with at least one change.
pub fn plan_tasks(
    results: &[DetectionResult],
    schema: &dyn SchemaProvider,
) -> Result<Vec<MigrationTask>> {
    results
        .iter()
        .filter(|r| !r.changes_detected.is_empty())
        .map(|r| MigrationTask::from_detection(r, schema))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sorted_and_unique() {
        let task = MigrationTask::new(
            "doctor",
            vec![RecordKey::from(3), RecordKey::from(1), RecordKey::from(3)],
        );
        assert_eq!(task.record_ids, vec![RecordKey::from(1), RecordKey::from(3)]);
        assert_eq!(task.estimated_duration_ms, 4);
    }

    #[test]
    fn test_ids_after_checkpoint_key() {
        let task = MigrationTask::new("doctor", (1..=10).map(RecordKey::from).collect());
        assert_eq!(task.ids_after(None).len(), 10);
        assert_eq!(
            task.ids_after(Some(&RecordKey::from(4))).first(),
            Some(&RecordKey::from(5))
        );
        assert!(task.ids_after(Some(&RecordKey::from(10))).is_empty());
        // A key that is not in the list still splits correctly.
        let sparse = MigrationTask::new("doctor", vec![RecordKey::from(2), RecordKey::from(8)]);
        assert_eq!(sparse.ids_after(Some(&RecordKey::from(5))), &[RecordKey::from(8)]);
    }
}
