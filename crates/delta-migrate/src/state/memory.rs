//! In-process state backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::document::StateDocument;
use super::StateBackend;
use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::session::{Lease, RunRecord};

/// State held in process memory. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    doc: Mutex<StateDocument>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn doc(&self) -> MutexGuard<'_, StateDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.doc().save_run(run);
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.doc().load_run(run_id))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self.doc().list_runs(limit))
    }

    async fn find_run_by_checkpoint(&self, checkpoint_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.doc().find_run_by_checkpoint(checkpoint_id))
    }

    async fn try_acquire_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        self.doc().acquire_lease(run_id, owner, ttl)
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()> {
        self.doc().release_lease(run_id, owner);
        Ok(())
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.doc().insert_checkpoint(checkpoint)
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.doc().update_checkpoint(checkpoint)
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.doc().checkpoints.get(id).cloned())
    }

    async fn latest_checkpoint(
        &self,
        entity_type: &str,
        run_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        Ok(self.doc().latest_checkpoint(entity_type, run_id))
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.doc().list_checkpoints(run_id))
    }

    async fn delete_checkpoints_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self.doc().delete_checkpoints_before(cutoff))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::MigrationTask;
    use crate::error::MigrateError;

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let backend = MemoryStateBackend::new();
        let run = RunRecord::new("hash", vec![MigrationTask::new("a", vec![])]);
        backend.save_run(&run).await.unwrap();

        backend
            .try_acquire_lease(&run.run_id, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        // Renewal by the holder is fine.
        backend
            .try_acquire_lease(&run.run_id, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        let err = backend
            .try_acquire_lease(&run.run_id, "w2", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::LeaseHeld { .. }));

        backend.release_lease(&run.run_id, "w1").await.unwrap();
        backend
            .try_acquire_lease(&run.run_id, "w2", Duration::from_secs(60))
            .await
            .unwrap();
        let loaded = backend.load_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.lease.unwrap().owner, "w2");
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let backend = MemoryStateBackend::new();
        let run = RunRecord::new("hash", vec![]);
        backend.save_run(&run).await.unwrap();
        backend
            .try_acquire_lease(&run.run_id, "w1", Duration::from_secs(0))
            .await
            .unwrap();
        assert!(backend
            .try_acquire_lease(&run.run_id, "w2", Duration::from_secs(60))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_lease_on_unknown_run() {
        let backend = MemoryStateBackend::new();
        assert!(matches!(
            backend
                .try_acquire_lease("nope", "w1", Duration::from_secs(1))
                .await,
            Err(MigrateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_run_does_not_write_lease() {
        let backend = MemoryStateBackend::new();
        let mut run = RunRecord::new("hash", vec![]);
        backend.save_run(&run).await.unwrap();
        backend
            .try_acquire_lease(&run.run_id, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        run.lease = None;
        run.pause_requested = true;
        backend.save_run(&run).await.unwrap();
        let loaded = backend.load_run(&run.run_id).await.unwrap().unwrap();
        assert!(loaded.pause_requested);
        assert_eq!(loaded.lease.unwrap().owner, "w1");
    }
}
