//! State backend trait for run and checkpoint storage.
//!
//! The [`StateBackend`] trait defines the interface for persisting run
//! sessions, leases and checkpoints. Implementations:
//!
//! - **Memory**: [`super::MemoryStateBackend`], for tests and dry runs
//! - **File**: [`super::FileStateBackend`], one HMAC-signed JSON document
//! - **PostgreSQL**: [`super::PgStateBackend`], tables in the state schema
//!
//! # Design Pattern
//!
//! This uses the Strategy pattern to decouple state storage from the executor.
//! The executor works with `Arc<dyn StateBackend>` without knowing the
//! concrete type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::session::{Lease, RunRecord};

/// Trait for run-state persistence backends.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let backend: Arc<dyn StateBackend> = Arc::new(PgStateBackend::new(pool, "_delta_migrate"));
/// backend.init_schema().await?;
/// backend.save_run(&run).await?;
/// let lease = backend.try_acquire_lease(&run.run_id, "worker-1", ttl).await?;
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Initialize the storage schema/structure. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Insert or replace a run record. The lease is managed separately and
    /// is not written here.
    async fn save_run(&self, run: &RunRecord) -> Result<()>;

    /// Load a run with its current lease.
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;

    /// The run a checkpoint belongs to.
    async fn find_run_by_checkpoint(&self, checkpoint_id: &str) -> Result<Option<RunRecord>>;

    /// Take or renew the run's lease for `owner`.
    ///
    /// Fails with `LeaseHeld` while another owner holds a live lease and
    /// with `NotFound` for an unknown run.
    async fn try_acquire_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Release the lease if `owner` holds it.
    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()>;

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Overwrite a checkpoint. Fails if it would lower `records_processed`.
    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>>;

    /// Most recently updated checkpoint for an entity, optionally in one run.
    async fn latest_checkpoint(
        &self,
        entity_type: &str,
        run_id: Option<&str>,
    ) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a run, oldest first.
    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>>;

    /// Delete non-resumable checkpoints last updated at or before `cutoff`.
    async fn delete_checkpoints_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}
