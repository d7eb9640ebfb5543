//! Conflict resolution: materializing differentials into the destination.
//!
//! A batch of record ids is resolved inside one destination transaction.
//! Each record is reclassified against the mapping as it stands at apply
//! time, so re-offering an already applied record converges instead of
//! writing twice.

mod review;
mod snapshot;

pub use review::{
    FileReviewQueue, ManualReviewQueue, MemoryReviewQueue, PgReviewQueue, ReviewItem,
};
pub use snapshot::{FileSnapshotSink, MemorySnapshotSink, SnapshotSink};

pub use crate::config::ConflictPolicy;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::{Predicate, RecordKey, Row, SelectQuery};
use crate::detect::{ChangeType, MigrationTask};
use crate::error::{MigrateError, Result};
use crate::mapping::{MappingStore, MigrationMapping};
use crate::schema::{EntityDescriptor, EntityTransformer, SchemaProvider};
use crate::session::RecordFailure;
use crate::store::{DestinationStore, DestinationTx, SourceStore, UpsertOutcome};

/// Counters for one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub records: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub failures: Vec<RecordFailure>,
    /// Last key of the batch, for the checkpoint.
    pub last_key: Option<RecordKey>,
}

impl BatchOutcome {
    pub fn failed(&self) -> u64 {
        self.failures.len() as u64
    }

    /// Fold a later sub-batch into this one.
    pub fn merge(&mut self, other: BatchOutcome) {
        self.records += other.records;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
        self.failures.extend(other.failures);
        if other.last_key.is_some() {
            self.last_key = other.last_key;
        }
    }
}

enum Action {
    Inserted,
    Updated,
    Deleted,
    Skipped,
    Deferred(ReviewItem),
}

/// Applies a [`ConflictPolicy`] to batches of detected record ids.
pub struct ConflictResolver {
    policy: ConflictPolicy,
    schema: Arc<dyn SchemaProvider>,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    review_queue: Option<Arc<dyn ManualReviewQueue>>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl ConflictResolver {
    pub fn new(
        policy: ConflictPolicy,
        schema: Arc<dyn SchemaProvider>,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            policy,
            schema,
            source,
            destination,
            review_queue: None,
            snapshots: None,
        }
    }

    pub fn with_review_queue(mut self, queue: Arc<dyn ManualReviewQueue>) -> Self {
        self.review_queue = Some(queue);
        self
    }

    /// Snapshot affected destination rows before each batch is resolved.
    pub fn with_snapshots(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolve `ids` of `task` in one destination transaction.
    ///
    /// Record-level failures (validation, unresolvable conflicts) are
    /// collected in the outcome. Any other error rolls the whole batch back
    /// and is returned to the caller.
    pub async fn apply_batch(
        &self,
        run_id: &str,
        task: &MigrationTask,
        ids: &[RecordKey],
    ) -> Result<BatchOutcome> {
        let entity = task.entity_type.as_str();
        let descriptor = self.schema.descriptor(entity)?;
        let transformer = self.schema.transformer(entity)?;
        let source_rows = self.fetch_source(descriptor, ids).await?;

        // Read before the transaction holds a connection.
        if let Some(sink) = &self.snapshots {
            self.take_snapshot(sink.as_ref(), run_id, descriptor, ids)
                .await;
        }

        let mut tx = self.destination.begin().await?;
        let resolved = self
            .resolve_in(
                tx.as_mut(),
                run_id,
                task,
                descriptor,
                transformer.as_ref(),
                ids,
                &source_rows,
            )
            .await;

        let (outcome, deferred) = match resolved {
            Ok(done) => done,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(entity, "rollback failed: {}", rb);
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        if !deferred.is_empty() {
            match &self.review_queue {
                Some(queue) => queue.enqueue(deferred).await?,
                None => warn!(
                    entity,
                    count = deferred.len(),
                    "manual policy without a review queue; deferred records are only counted"
                ),
            }
        }
        Ok(outcome)
    }

    /// Current active source rows for `ids`, keyed by legacy id.
    async fn fetch_source(
        &self,
        descriptor: &EntityDescriptor,
        ids: &[RecordKey],
    ) -> Result<HashMap<RecordKey, Row>> {
        let query = SelectQuery::on(descriptor.source_table.clone())
            .filter(Predicate::is_in(
                descriptor.legacy_id_field.clone(),
                ids.iter().map(RecordKey::to_value).collect(),
            ))
            .filter_opt(descriptor.active_predicate.clone());
        Ok(self
            .source
            .select(&query)
            .await?
            .into_iter()
            .filter_map(|row| row.key(&descriptor.legacy_id_field).map(|k| (k, row)))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_in(
        &self,
        tx: &mut dyn DestinationTx,
        run_id: &str,
        task: &MigrationTask,
        descriptor: &EntityDescriptor,
        transformer: &dyn EntityTransformer,
        ids: &[RecordKey],
        source_rows: &HashMap<RecordKey, Row>,
    ) -> Result<(BatchOutcome, Vec<ReviewItem>)> {
        let entity = descriptor.entity_type.as_str();
        let mut mappings = Vec::with_capacity(ids.len());
        for id in ids {
            mappings.push(tx.get_mapping(entity, id).await?);
        }

        let mut outcome = BatchOutcome {
            records: ids.len() as u64,
            last_key: ids.last().cloned(),
            ..Default::default()
        };
        let mut deferred = Vec::new();

        for (id, mapping) in ids.iter().zip(mappings) {
            let action = self
                .resolve_record(
                    tx,
                    run_id,
                    descriptor,
                    transformer,
                    id,
                    source_rows.get(id),
                    mapping,
                    task.hint(id),
                )
                .await;
            match action {
                Ok(Action::Inserted) => outcome.inserted += 1,
                Ok(Action::Updated) => outcome.updated += 1,
                Ok(Action::Deleted) => outcome.deleted += 1,
                Ok(Action::Skipped) => outcome.skipped += 1,
                Ok(Action::Deferred(item)) => {
                    outcome.deferred += 1;
                    deferred.push(item);
                }
                Err(e) if e.is_record_level() => {
                    warn!(entity, record = %id, "record failed: {}", e);
                    outcome.failures.push(RecordFailure {
                        record_id: id.to_string(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok((outcome, deferred))
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_record(
        &self,
        tx: &mut dyn DestinationTx,
        run_id: &str,
        descriptor: &EntityDescriptor,
        transformer: &dyn EntityTransformer,
        id: &RecordKey,
        source: Option<&Row>,
        mapping: Option<MigrationMapping>,
        hint: Option<ChangeType>,
    ) -> Result<Action> {
        let entity = descriptor.entity_type.as_str();
        match (source, mapping) {
            (Some(_), None) if hint == Some(ChangeType::Modified) => Err(MigrateError::conflict(
                entity,
                id,
                "modified record has no mapping",
            )),
            (Some(row), None) => self.upsert(tx, descriptor, transformer, id, row, None).await,
            (Some(row), Some(existing)) => {
                if descriptor.content_hash(row) == existing.checksum {
                    debug!(entity, record = %id, "already up to date");
                    return Ok(Action::Skipped);
                }
                match self.policy {
                    ConflictPolicy::SourceWins => {
                        self.upsert(tx, descriptor, transformer, id, row, Some(&existing))
                            .await
                    }
                    ConflictPolicy::TargetWins => Ok(Action::Skipped),
                    ConflictPolicy::Manual => Ok(Action::Deferred(review_item(
                        run_id,
                        entity,
                        id,
                        ChangeType::Modified,
                        Some(row),
                        Some(&existing),
                    ))),
                }
            }
            (None, Some(existing)) => {
                if hint != Some(ChangeType::Deleted) {
                    debug!(entity, record = %id, "source row gone since detection; left for next detection");
                    return Ok(Action::Skipped);
                }
                match self.policy {
                    ConflictPolicy::SourceWins => {
                        tx.delete_row(
                            &descriptor.destination_table,
                            &descriptor.destination_id_field,
                            &Value::String(existing.new_id.clone()),
                        )
                        .await?;
                        tx.delete_mapping(entity, id).await?;
                        Ok(Action::Deleted)
                    }
                    ConflictPolicy::TargetWins => Ok(Action::Skipped),
                    ConflictPolicy::Manual => Ok(Action::Deferred(review_item(
                        run_id,
                        entity,
                        id,
                        ChangeType::Deleted,
                        None,
                        Some(&existing),
                    ))),
                }
            }
            (None, None) => {
                // A deletion already applied, or a record that vanished.
                debug!(entity, record = %id, "nothing to apply");
                Ok(Action::Skipped)
            }
        }
    }

    /// Transform and upsert one row, then write its mapping. Both go through
    /// the same transaction.
    async fn upsert(
        &self,
        tx: &mut dyn DestinationTx,
        descriptor: &EntityDescriptor,
        transformer: &dyn EntityTransformer,
        id: &RecordKey,
        source: &Row,
        existing: Option<&MigrationMapping>,
    ) -> Result<Action> {
        let mut row = transformer.transform(source)?;
        let mapping = MigrationMapping::assign(
            &descriptor.entity_type,
            id.clone(),
            descriptor.content_hash(source),
            existing,
        );
        row.insert(
            descriptor.destination_id_field.clone(),
            Value::String(mapping.new_id.clone()),
        );
        if let Some(field) = &descriptor.legacy_id_destination_field {
            row.insert(field.clone(), id.to_value());
        }

        let written = tx
            .upsert_row(
                &descriptor.destination_table,
                &descriptor.destination_id_field,
                &row,
                &descriptor.preserved_destination_fields,
            )
            .await?;
        tx.put_mapping(&mapping).await?;

        Ok(match written {
            UpsertOutcome::Inserted => Action::Inserted,
            UpsertOutcome::Updated => Action::Updated,
        })
    }

    /// Best effort: a failing snapshot is logged and resolution continues.
    async fn take_snapshot(
        &self,
        sink: &dyn SnapshotSink,
        run_id: &str,
        descriptor: &EntityDescriptor,
        ids: &[RecordKey],
    ) {
        let mappings = match self
            .destination
            .get_mappings(&descriptor.entity_type, ids)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(entity = %descriptor.entity_type, "snapshot mapping lookup failed: {}", e);
                return;
            }
        };
        let new_ids: Vec<Value> = ids
            .iter()
            .filter_map(|id| mappings.get(id))
            .map(|m| Value::String(m.new_id.clone()))
            .collect();
        if new_ids.is_empty() {
            return;
        }
        let query = SelectQuery::on(descriptor.destination_table.clone()).filter(
            Predicate::is_in(descriptor.destination_id_field.clone(), new_ids),
        );
        let rows = match self.destination.select(&query).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(entity = %descriptor.entity_type, "snapshot read failed: {}", e);
                return;
            }
        };
        if let Err(e) = sink.snapshot(run_id, &descriptor.entity_type, &rows).await {
            warn!(entity = %descriptor.entity_type, "snapshot write failed: {}", e);
        }
    }
}

fn review_item(
    run_id: &str,
    entity: &str,
    id: &RecordKey,
    change_type: ChangeType,
    source: Option<&Row>,
    existing: Option<&MigrationMapping>,
) -> ReviewItem {
    ReviewItem {
        run_id: run_id.to_string(),
        entity_type: entity.to_string(),
        record_id: id.clone(),
        change_type,
        source_row: source.cloned(),
        new_id: existing.map(|m| m.new_id.clone()),
        queued_at: Utc::now(),
    }
}
