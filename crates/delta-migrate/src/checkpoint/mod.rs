//! Durable, resumable progress markers.
//!
//! A checkpoint always describes a fully committed batch boundary. For a given
//! run and entity there is at most one resumable checkpoint, and its
//! `records_processed` never decreases. Finished checkpoints are kept as
//! non-resumable audit records until retention cleanup removes them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::RecordKey;
use crate::error::{MigrateError, Result};
use crate::state::StateBackend;

/// Checkpoint status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Paused => "paused",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl FromStr for CheckpointStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CheckpointStatus::Pending),
            "running" => Ok(CheckpointStatus::Running),
            "paused" => Ok(CheckpointStatus::Paused),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(MigrateError::State(format!(
                "Invalid checkpoint status: {}",
                other
            ))),
        }
    }
}

/// Progress marker for one entity within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub entity_type: String,
    pub status: CheckpointStatus,
    /// Last key of the last fully committed batch.
    pub last_processed_key: Option<RecordKey>,
    pub records_processed: u64,
    pub records_total: u64,
    pub batches_committed: u64,
    /// Whether execution may continue from this checkpoint.
    pub resumable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn new(run_id: &str, entity_type: &str, records_total: u64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            entity_type: entity_type.to_string(),
            status: CheckpointStatus::Pending,
            last_processed_key: None,
            records_processed: 0,
            records_total,
            batches_committed: 0,
            resumable: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when `other` carries the same progress state (timestamps aside).
    fn same_state(&self, other: &Checkpoint) -> bool {
        self.status == other.status
            && self.last_processed_key == other.last_processed_key
            && self.records_processed == other.records_processed
            && self.records_total == other.records_total
            && self.batches_committed == other.batches_committed
            && self.resumable == other.resumable
    }
}

/// Progress written at a batch boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointProgress {
    pub status: CheckpointStatus,
    pub last_processed_key: Option<RecordKey>,
    pub records_processed: u64,
    pub batches_committed: u64,
}

/// Creates and advances checkpoints through a [`StateBackend`].
#[derive(Clone)]
pub struct CheckpointManager {
    backend: Arc<dyn StateBackend>,
}

impl CheckpointManager {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Create the checkpoint for `(run_id, entity_type)`.
    ///
    /// If a resumable checkpoint already exists for the pair it is returned
    /// unchanged, so there is never more than one active checkpoint.
    pub async fn create(
        &self,
        run_id: &str,
        entity_type: &str,
        records_total: u64,
    ) -> Result<Checkpoint> {
        if let Some(existing) = self.active_for(run_id, entity_type).await? {
            return Ok(existing);
        }
        let checkpoint = Checkpoint::new(run_id, entity_type, records_total);
        self.backend
            .insert_checkpoint(&checkpoint)
            .await
            .map_err(|e| MigrateError::Checkpoint(e.to_string()))?;
        debug!(run_id, entity = entity_type, id = %checkpoint.id, "checkpoint created");
        Ok(checkpoint)
    }

    /// Advance a checkpoint.
    ///
    /// Rejects any update that would lower `records_processed`. Writing the
    /// state the checkpoint already holds is a no-op.
    pub async fn update(&self, id: &str, progress: CheckpointProgress) -> Result<Checkpoint> {
        let current = self.get(id).await?;
        if progress.records_processed < current.records_processed {
            return Err(MigrateError::Checkpoint(format!(
                "checkpoint {} would regress from {} to {} records",
                id, current.records_processed, progress.records_processed
            )));
        }

        let mut next = current.clone();
        next.status = progress.status;
        next.last_processed_key = progress.last_processed_key.or(current.last_processed_key.clone());
        next.records_processed = progress.records_processed;
        next.batches_committed = progress.batches_committed.max(current.batches_committed);
        if current.same_state(&next) {
            return Ok(current);
        }
        next.updated_at = Utc::now();
        self.write(&next).await?;
        Ok(next)
    }

    /// Mark a checkpoint completed; it stays as a non-resumable audit record.
    pub async fn complete(&self, id: &str) -> Result<Checkpoint> {
        self.finish(id, CheckpointStatus::Completed, false).await
    }

    /// Mark a checkpoint failed. It remains resumable for a retry.
    pub async fn fail(&self, id: &str) -> Result<Checkpoint> {
        self.finish(id, CheckpointStatus::Failed, true).await
    }

    /// Make every checkpoint of a run non-resumable.
    pub async fn retire_run(&self, run_id: &str) -> Result<usize> {
        let mut retired = 0;
        for mut checkpoint in self.backend.list_checkpoints(run_id).await? {
            if checkpoint.resumable {
                checkpoint.resumable = false;
                checkpoint.updated_at = Utc::now();
                self.write(&checkpoint).await?;
                retired += 1;
            }
        }
        Ok(retired)
    }

    pub async fn get(&self, id: &str) -> Result<Checkpoint> {
        self.backend
            .get_checkpoint(id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("checkpoint {}", id)))
    }

    /// Latest checkpoint for an entity, optionally within one run.
    pub async fn latest_for_entity(
        &self,
        entity_type: &str,
        run_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        self.backend.latest_checkpoint(entity_type, run_id).await
    }

    /// The resumable checkpoint for `(run_id, entity_type)`, if any.
    pub async fn active_for(&self, run_id: &str, entity_type: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .backend
            .list_checkpoints(run_id)
            .await?
            .into_iter()
            .find(|c| c.entity_type == entity_type && c.resumable))
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        self.backend.list_checkpoints(run_id).await
    }

    /// Remove non-resumable checkpoints older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let removed = self.backend.delete_checkpoints_before(cutoff).await?;
        info!(removed, retention_days, "checkpoint retention cleanup");
        Ok(removed)
    }

    async fn finish(&self, id: &str, status: CheckpointStatus, resumable: bool) -> Result<Checkpoint> {
        let mut checkpoint = self.get(id).await?;
        if checkpoint.status == status && checkpoint.resumable == resumable {
            return Ok(checkpoint);
        }
        checkpoint.status = status;
        checkpoint.resumable = resumable;
        checkpoint.updated_at = Utc::now();
        self.write(&checkpoint).await?;
        Ok(checkpoint)
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.backend
            .update_checkpoint(checkpoint)
            .await
            .map_err(|e| match e {
                MigrateError::Checkpoint(_) => e,
                other => MigrateError::Checkpoint(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateBackend;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryStateBackend::new()))
    }

    fn progress(processed: u64, key: i64) -> CheckpointProgress {
        CheckpointProgress {
            status: CheckpointStatus::Running,
            last_processed_key: Some(RecordKey::Int(key)),
            records_processed: processed,
            batches_committed: processed / 10,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_run_entity() {
        let m = manager();
        let a = m.create("run-1", "doctor", 100).await.unwrap();
        let b = m.create("run-1", "doctor", 100).await.unwrap();
        assert_eq!(a.id, b.id);
        let c = m.create("run-1", "clinic", 5).await.unwrap();
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_update_rejects_regression() {
        let m = manager();
        let cp = m.create("run-1", "doctor", 100).await.unwrap();
        m.update(&cp.id, progress(20, 20)).await.unwrap();
        let err = m.update(&cp.id, progress(10, 10)).await.unwrap_err();
        assert!(matches!(err, MigrateError::Checkpoint(_)));
        assert_eq!(m.get(&cp.id).await.unwrap().records_processed, 20);
    }

    #[tokio::test]
    async fn test_same_state_update_is_noop() {
        let m = manager();
        let cp = m.create("run-1", "doctor", 100).await.unwrap();
        let first = m.update(&cp.id, progress(20, 20)).await.unwrap();
        let second = m.update(&cp.id, progress(20, 20)).await.unwrap();
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_complete_retains_non_resumable_record() {
        let m = manager();
        let cp = m.create("run-1", "doctor", 10).await.unwrap();
        let done = m.complete(&cp.id).await.unwrap();
        assert_eq!(done.status, CheckpointStatus::Completed);
        assert!(!done.resumable);
        assert!(m.active_for("run-1", "doctor").await.unwrap().is_none());
        assert_eq!(m.list_for_run("run-1").await.unwrap().len(), 1);

        // A later create for the same pair starts a fresh active checkpoint.
        let again = m.create("run-1", "doctor", 10).await.unwrap();
        assert_ne!(again.id, cp.id);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_resumable() {
        let m = manager();
        let active = m.create("run-1", "doctor", 10).await.unwrap();
        let done = m.create("run-1", "clinic", 10).await.unwrap();
        m.complete(&done.id).await.unwrap();

        let removed = m.cleanup(0).await.unwrap();
        assert_eq!(removed, 1);
        assert!(m.get(&active.id).await.is_ok());
        assert!(matches!(m.get(&done.id).await, Err(MigrateError::NotFound(_))));
    }
}
