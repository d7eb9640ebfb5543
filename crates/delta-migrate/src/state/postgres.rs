//! Database-backed state storage for sync runs.
//!
//! Stores run sessions and checkpoints in PostgreSQL tables within the state
//! schema (`_delta_migrate` by default). This is preferred over file-based
//! state for production use:
//! - Transactional safety
//! - Multi-instance coordination through row-level leases
//! - No file system access required
//!
//! The run record itself is kept as `jsonb`; the columns beside it exist for
//! lookups and lease arbitration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use std::time::Duration;
use tracing::debug;

use super::StateBackend;
use crate::checkpoint::{Checkpoint, CheckpointStatus};
use crate::core::RecordKey;
use crate::error::{MigrateError, Result};
use crate::session::{Lease, RunRecord};
use crate::store::quote_ident;

/// PostgreSQL state backend.
pub struct PgStateBackend {
    pool: Pool,
    schema: String,
}

const CHECKPOINT_COLUMNS: &str = "id, run_id, entity_type, status, last_processed_key, \
     records_processed, records_total, batches_committed, resumable, created_at, updated_at";

impl PgStateBackend {
    pub fn new(pool: Pool, schema: &str) -> Self {
        Self {
            pool,
            schema: quote_ident(schema),
        }
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), context))
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    fn run_from_row(row: &tokio_postgres::Row) -> Result<RunRecord> {
        let record: serde_json::Value = row.try_get("record")?;
        let mut run: RunRecord = serde_json::from_value(record)?;
        let owner: Option<String> = row.try_get("lease_owner")?;
        let expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        run.lease = match (owner, expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        };
        Ok(run)
    }

    fn checkpoint_from_row(row: &tokio_postgres::Row) -> Result<Checkpoint> {
        let status: String = row.try_get("status")?;
        let key: Option<String> = row.try_get("last_processed_key")?;
        Ok(Checkpoint {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            entity_type: row.try_get("entity_type")?,
            status: status.parse()?,
            last_processed_key: key.as_deref().map(RecordKey::decode).transpose()?,
            records_processed: row.try_get::<_, i64>("records_processed")? as u64,
            records_total: row.try_get::<_, i64>("records_total")? as u64,
            batches_committed: row.try_get::<_, i64>("batches_committed")? as u64,
            resumable: row.try_get("resumable")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn status_list() -> String {
    [
        CheckpointStatus::Pending,
        CheckpointStatus::Running,
        CheckpointStatus::Paused,
        CheckpointStatus::Completed,
        CheckpointStatus::Failed,
    ]
    .iter()
    .map(|s| format!("'{}'", s.as_str()))
    .collect::<Vec<_>>()
    .join(", ")
}

#[async_trait]
impl StateBackend for PgStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let client = self.client("initializing state schema").await?;

        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};

                CREATE TABLE IF NOT EXISTS {runs} (
                    run_id TEXT PRIMARY KEY,
                    config_hash TEXT NOT NULL,
                    status TEXT NOT NULL,
                    record JSONB NOT NULL,
                    lease_owner TEXT,
                    lease_expires_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE INDEX IF NOT EXISTS idx_sync_runs_latest
                    ON {runs}(created_at DESC);

                CREATE TABLE IF NOT EXISTS {checkpoints} (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES {runs}(run_id) ON DELETE CASCADE,
                    entity_type TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ({statuses})),
                    last_processed_key TEXT,
                    records_processed BIGINT NOT NULL DEFAULT 0,
                    records_total BIGINT NOT NULL DEFAULT 0,
                    batches_committed BIGINT NOT NULL DEFAULT 0,
                    resumable BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_one_active
                    ON {checkpoints}(run_id, entity_type) WHERE resumable;

                CREATE INDEX IF NOT EXISTS idx_checkpoints_entity_latest
                    ON {checkpoints}(entity_type, updated_at DESC);",
                schema = self.schema,
                runs = self.table("sync_runs"),
                checkpoints = self.table("checkpoints"),
                statuses = status_list(),
            ))
            .await
            .map_err(|e| MigrateError::from_pg(e, "state schema"))?;

        debug!("State schema {} ready", self.schema);
        Ok(())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let client = self.client("saving run").await?;
        let mut stored = run.clone();
        stored.lease = None;
        let record = serde_json::to_value(&stored)?;

        client
            .execute(
                &format!(
                    "INSERT INTO {} (run_id, config_hash, status, record, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (run_id) DO UPDATE SET
                        status = EXCLUDED.status,
                        record = EXCLUDED.record,
                        updated_at = EXCLUDED.updated_at",
                    self.table("sync_runs")
                ),
                &[
                    &run.run_id,
                    &run.config_hash,
                    &run.status().as_str(),
                    &record,
                    &run.created_at,
                    &run.updated_at,
                ],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "sync_runs"))?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let client = self.client("loading run").await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT record, lease_owner, lease_expires_at FROM {} WHERE run_id = $1",
                    self.table("sync_runs")
                ),
                &[&run_id],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "sync_runs"))?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let client = self.client("listing runs").await?;
        let rows = client
            .query(
                &format!(
                    "SELECT record, lease_owner, lease_expires_at FROM {}
                     ORDER BY created_at DESC LIMIT $1",
                    self.table("sync_runs")
                ),
                &[&(limit as i64)],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "sync_runs"))?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn find_run_by_checkpoint(&self, checkpoint_id: &str) -> Result<Option<RunRecord>> {
        let client = self.client("finding run by checkpoint").await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT r.record, r.lease_owner, r.lease_expires_at
                     FROM {} r JOIN {} c ON c.run_id = r.run_id
                     WHERE c.id = $1",
                    self.table("sync_runs"),
                    self.table("checkpoints")
                ),
                &[&checkpoint_id],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn try_acquire_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let client = self.client("acquiring lease").await?;
        let runs = self.table("sync_runs");

        // Single conditional UPDATE so two executors cannot both win.
        let acquired = client
            .query_opt(
                &format!(
                    "UPDATE {} SET lease_owner = $2,
                        lease_expires_at = NOW() + make_interval(secs => $3)
                     WHERE run_id = $1
                       AND (lease_owner IS NULL OR lease_owner = $2 OR lease_expires_at <= NOW())
                     RETURNING lease_owner, lease_expires_at",
                    runs
                ),
                &[&run_id, &owner, &ttl.as_secs_f64()],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "sync_runs"))?;

        if let Some(row) = acquired {
            return Ok(Lease {
                owner: row.try_get("lease_owner")?,
                expires_at: row.try_get("lease_expires_at")?,
            });
        }

        let current = client
            .query_opt(
                &format!(
                    "SELECT lease_owner, lease_expires_at FROM {} WHERE run_id = $1",
                    runs
                ),
                &[&run_id],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "sync_runs"))?
            .ok_or_else(|| MigrateError::NotFound(format!("run {}", run_id)))?;

        let holder: Option<String> = current.try_get("lease_owner")?;
        let expires_at: Option<DateTime<Utc>> = current.try_get("lease_expires_at")?;
        Err(MigrateError::LeaseHeld {
            run_id: run_id.to_string(),
            owner: holder.unwrap_or_default(),
            expires_at: expires_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        })
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()> {
        let client = self.client("releasing lease").await?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET lease_owner = NULL, lease_expires_at = NULL
                     WHERE run_id = $1 AND lease_owner = $2",
                    self.table("sync_runs")
                ),
                &[&run_id, &owner],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "sync_runs"))?;
        Ok(())
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let client = self.client("inserting checkpoint").await?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                    self.table("checkpoints"),
                    CHECKPOINT_COLUMNS
                ),
                &[
                    &checkpoint.id,
                    &checkpoint.run_id,
                    &checkpoint.entity_type,
                    &checkpoint.status.as_str(),
                    &checkpoint.last_processed_key.as_ref().map(RecordKey::encode),
                    &(checkpoint.records_processed as i64),
                    &(checkpoint.records_total as i64),
                    &(checkpoint.batches_committed as i64),
                    &checkpoint.resumable,
                    &checkpoint.created_at,
                    &checkpoint.updated_at,
                ],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;
        Ok(())
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let client = self.client("updating checkpoint").await?;
        let table = self.table("checkpoints");
        let updated = client
            .execute(
                &format!(
                    "UPDATE {} SET status = $2, last_processed_key = $3, records_processed = $4,
                        records_total = $5, batches_committed = $6, resumable = $7, updated_at = $8
                     WHERE id = $1 AND records_processed <= $4",
                    table
                ),
                &[
                    &checkpoint.id,
                    &checkpoint.status.as_str(),
                    &checkpoint.last_processed_key.as_ref().map(RecordKey::encode),
                    &(checkpoint.records_processed as i64),
                    &(checkpoint.records_total as i64),
                    &(checkpoint.batches_committed as i64),
                    &checkpoint.resumable,
                    &checkpoint.updated_at,
                ],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;

        if updated == 0 {
            return match self.get_checkpoint(&checkpoint.id).await? {
                Some(current) => Err(MigrateError::Checkpoint(format!(
                    "checkpoint {} would regress from {} to {} records",
                    checkpoint.id, current.records_processed, checkpoint.records_processed
                ))),
                None => Err(MigrateError::NotFound(format!("checkpoint {}", checkpoint.id))),
            };
        }
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let client = self.client("loading checkpoint").await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE id = $1",
                    CHECKPOINT_COLUMNS,
                    self.table("checkpoints")
                ),
                &[&id],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;
        row.as_ref().map(Self::checkpoint_from_row).transpose()
    }

    async fn latest_checkpoint(
        &self,
        entity_type: &str,
        run_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let client = self.client("loading latest checkpoint").await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM {}
                     WHERE entity_type = $1 AND ($2::text IS NULL OR run_id = $2)
                     ORDER BY updated_at DESC LIMIT 1",
                    CHECKPOINT_COLUMNS,
                    self.table("checkpoints")
                ),
                &[&entity_type, &run_id],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;
        row.as_ref().map(Self::checkpoint_from_row).transpose()
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let client = self.client("listing checkpoints").await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE run_id = $1 ORDER BY created_at",
                    CHECKPOINT_COLUMNS,
                    self.table("checkpoints")
                ),
                &[&run_id],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;
        rows.iter().map(Self::checkpoint_from_row).collect()
    }

    async fn delete_checkpoints_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.client("cleaning up checkpoints").await?;
        let removed = client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE NOT resumable AND updated_at <= $1",
                    self.table("checkpoints")
                ),
                &[&cutoff],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "checkpoints"))?;
        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
