//! Differential change detection.
//!
//! Detection compares the source against the mapping store for one entity
//! type and returns one atomic [`DetectionResult`]:
//!
//! 1. Keyset-page the active source rows changed since the baseline (rows
//!    with a null timestamp are always included), ascending by legacy key.
//! 2. Hash each row over its canonical field set and classify it against its
//!    mapping: no mapping is `new`, a different stored checksum is `modified`.
//! 3. Optionally page the mapped legacy ids and look them up in the active
//!    source query; ids that are gone are `deleted`. Unmapped destination
//!    rows are never considered.
//!
//! Only source-side timestamps are used as the time authority.

mod task;

pub use task::{plan_tasks, MigrationTask};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::core::{Predicate, RecordKey, SelectQuery};
use crate::error::Result;
use crate::mapping::MappingStore;
use crate::schema::SchemaProvider;
use crate::store::{DestinationStore, SourceStore};

/// Kind of detected differential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    New,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        }
    }
}

/// One detected unit of divergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub record_id: RecordKey,
    pub change_type: ChangeType,
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Hash of the current source row. `None` for deletions.
    pub content_hash: Option<String>,
    /// Checksum stored in the mapping, when one exists.
    pub previous_content_hash: Option<String>,
    /// Reporting metadata only; never gates behavior.
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub new: u64,
    pub modified: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub total_changes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub duration_ms: u64,
    pub source_queries: u64,
    pub mapping_lookups: u64,
    pub records_per_second: f64,
}

/// Result of one detection call. Produced whole or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub entity_type: String,
    pub analysis_id: String,
    pub baseline_timestamp: Option<DateTime<Utc>>,
    pub analysis_timestamp: DateTime<Utc>,
    /// Latest source timestamp seen; the baseline for the next detection.
    pub next_baseline: Option<DateTime<Utc>>,
    pub total_records_analyzed: u64,
    /// Ordered by ascending record id.
    pub changes_detected: Vec<ChangeRecord>,
    pub summary: DetectionSummary,
    pub performance: DetectionMetrics,
}

/// Detection parameters.
#[derive(Debug, Clone)]
pub struct DetectOptions {
    /// Exclusive lower bound on source timestamps. `None` scans everything.
    pub since: Option<DateTime<Utc>>,
    pub include_deletes: bool,
    pub batch_size: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            since: None,
            include_deletes: true,
            batch_size: 500,
        }
    }
}

/// Compares source rows with the mapping store.
#[derive(Clone)]
pub struct DifferentialDetector {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    schema: Arc<dyn SchemaProvider>,
}

impl DifferentialDetector {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        schema: Arc<dyn SchemaProvider>,
    ) -> Self {
        Self {
            source,
            destination,
            schema,
        }
    }

    /// Detect changes for one entity type.
    pub async fn detect(&self, entity_type: &str, options: &DetectOptions) -> Result<DetectionResult> {
        let started = Instant::now();
        let analysis_timestamp = Utc::now();
        let descriptor = self.schema.descriptor(entity_type)?;
        let batch_size = options.batch_size.max(1);

        let mut changes = Vec::new();
        let mut summary = DetectionSummary::default();
        let mut metrics = DetectionMetrics::default();
        let mut analyzed = 0u64;
        let mut next_baseline = options.since;
        let mut last_key: Option<RecordKey> = None;

        let since_filter = match (&descriptor.timestamp_field, options.since) {
            (Some(field), Some(since)) => {
                Some(Predicate::gt_or_null(field.clone(), since.to_rfc3339().into()))
            }
            _ => None,
        };

        loop {
            let query = SelectQuery::on(descriptor.source_table.clone())
                .filter_opt(
                    last_key
                        .as_ref()
                        .map(|k| Predicate::gt(descriptor.legacy_id_field.clone(), k.to_value())),
                )
                .filter_opt(since_filter.clone())
                .filter_opt(descriptor.active_predicate.clone())
                .order_by(descriptor.legacy_id_field.clone())
                .limit(batch_size);
            let rows = self.source.select(&query).await?;
            metrics.source_queries += 1;
            let page_len = rows.len();

            let mut page = Vec::with_capacity(page_len);
            for row in &rows {
                let key = descriptor.legacy_key(row)?;
                let timestamp = match &descriptor.timestamp_field {
                    Some(field) => row.timestamp(field)?,
                    None => None,
                };
                page.push((key, timestamp, descriptor.content_hash(row)));
            }

            let keys: Vec<RecordKey> = page.iter().map(|(k, _, _)| k.clone()).collect();
            let mappings = self.destination.get_mappings(entity_type, &keys).await?;
            metrics.mapping_lookups += 1;

            for (key, timestamp, hash) in page {
                analyzed += 1;
                if let Some(ts) = timestamp {
                    next_baseline = Some(next_baseline.map_or(ts, |b| b.max(ts)));
                }
                let (change_type, previous, confidence) = match mappings.get(&key) {
                    None => (ChangeType::New, None, 1.0),
                    Some(m) if m.checksum != hash => (
                        ChangeType::Modified,
                        Some(m.checksum.clone()),
                        if timestamp.is_some() { 1.0 } else { 0.8 },
                    ),
                    Some(_) => {
                        summary.unchanged += 1;
                        continue;
                    }
                };
                changes.push(ChangeRecord {
                    record_id: key,
                    change_type,
                    source_timestamp: timestamp,
                    content_hash: Some(hash),
                    previous_content_hash: previous,
                    confidence,
                });
            }

            last_key = keys.last().cloned();
            if page_len < batch_size {
                break;
            }
        }

        if options.include_deletes {
            let mut offset = 0usize;
            loop {
                let mapped = self
                    .destination
                    .list_mappings(entity_type, offset, batch_size)
                    .await?;
                metrics.mapping_lookups += 1;
                if mapped.is_empty() {
                    break;
                }
                let keys: Vec<_> = mapped.iter().map(|m| m.legacy_id.to_value()).collect();
                let query = SelectQuery::on(descriptor.source_table.clone())
                    .columns(&[descriptor.legacy_id_field.as_str()])
                    .filter(Predicate::is_in(descriptor.legacy_id_field.clone(), keys))
                    .filter_opt(descriptor.active_predicate.clone());
                let present: HashSet<RecordKey> = self
                    .source
                    .select(&query)
                    .await?
                    .iter()
                    .filter_map(|r| r.key(&descriptor.legacy_id_field))
                    .collect();
                metrics.source_queries += 1;

                for mapping in &mapped {
                    if !present.contains(&mapping.legacy_id) {
                        changes.push(ChangeRecord {
                            record_id: mapping.legacy_id.clone(),
                            change_type: ChangeType::Deleted,
                            source_timestamp: None,
                            content_hash: None,
                            previous_content_hash: Some(mapping.checksum.clone()),
                            confidence: 0.9,
                        });
                    }
                }

                offset += mapped.len();
                if mapped.len() < batch_size {
                    break;
                }
            }
        }

        changes.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        for change in &changes {
            match change.change_type {
                ChangeType::New => summary.new += 1,
                ChangeType::Modified => summary.modified += 1,
                ChangeType::Deleted => summary.deleted += 1,
            }
        }
        summary.total_changes = changes.len() as u64;

        let elapsed = started.elapsed();
        metrics.duration_ms = elapsed.as_millis() as u64;
        metrics.records_per_second = if elapsed.as_secs_f64() > 0.0 {
            analyzed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        info!(
            entity = entity_type,
            analyzed,
            new = summary.new,
            modified = summary.modified,
            deleted = summary.deleted,
            "change detection complete"
        );
        debug!(entity = entity_type, ?metrics, "detection metrics");

        Ok(DetectionResult {
            entity_type: entity_type.to_string(),
            analysis_id: uuid::Uuid::new_v4().to_string(),
            baseline_timestamp: options.since,
            analysis_timestamp,
            next_baseline,
            total_records_analyzed: analyzed,
            changes_detected: changes,
            summary,
            performance: metrics,
        })
    }
}
