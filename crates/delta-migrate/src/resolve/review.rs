//! Queue for differentials held back under the manual policy.
//!
//! Deferred items must outlive the process that deferred them: the CLI
//! uses [`PgReviewQueue`] next to PostgreSQL run state and
//! [`FileReviewQueue`] next to a state file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::{RecordKey, Row};
use crate::detect::ChangeType;
use crate::error::{MigrateError, Result};
use crate::store::quote_ident;

/// A differential waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub run_id: String,
    pub entity_type: String,
    pub record_id: RecordKey,
    pub change_type: ChangeType,
    /// Current source row; `None` for deletions.
    pub source_row: Option<Row>,
    pub new_id: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// External sink for deferred differentials. Items are never applied by
/// the engine itself.
#[async_trait]
pub trait ManualReviewQueue: Send + Sync {
    async fn enqueue(&self, items: Vec<ReviewItem>) -> Result<()>;

    /// Every queued item, oldest first.
    async fn pending(&self) -> Result<Vec<ReviewItem>>;
}

/// In-process review queue.
#[derive(Debug, Default)]
pub struct MemoryReviewQueue {
    items: Mutex<Vec<ReviewItem>>,
}

impl MemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<ReviewItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ManualReviewQueue for MemoryReviewQueue {
    async fn enqueue(&self, items: Vec<ReviewItem>) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(items);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<ReviewItem>> {
        Ok(self.items())
    }
}

/// Review queue kept as JSON lines in a local file.
#[derive(Debug)]
pub struct FileReviewQueue {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileReviewQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ManualReviewQueue for FileReviewQueue {
    async fn enqueue(&self, items: Vec<ReviewItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for item in &items {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        debug!(count = items.len(), path = %self.path.display(), "queued for manual review");
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<ReviewItem>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                // A crash mid-append leaves a torn last line.
                Err(e) => warn!(line = n + 1, path = %self.path.display(), "skipping unreadable review item: {}", e),
            }
        }
        Ok(items)
    }
}

/// Review queue stored in the state schema of the target database.
pub struct PgReviewQueue {
    pool: Pool,
    table: String,
    schema: String,
}

impl PgReviewQueue {
    pub fn new(pool: Pool, schema: &str) -> Self {
        let schema = quote_ident(schema);
        Self {
            pool,
            table: format!("{}.review_queue", schema),
            schema,
        }
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), context))
    }

    pub async fn init_schema(&self) -> Result<()> {
        let client = self.client("initializing review queue").await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};

                CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    record_id TEXT NOT NULL,
                    change_type TEXT NOT NULL,
                    item JSONB NOT NULL,
                    queued_at TIMESTAMPTZ NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_review_queue_entity
                    ON {table}(entity_type, record_id);",
                schema = self.schema,
                table = self.table,
            ))
            .await
            .map_err(|e| MigrateError::from_pg(e, "review_queue"))?;
        Ok(())
    }
}

#[async_trait]
impl ManualReviewQueue for PgReviewQueue {
    async fn enqueue(&self, items: Vec<ReviewItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut client = self.client("queueing review items").await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| MigrateError::from_pg(e, "review_queue"))?;
        let sql = format!(
            "INSERT INTO {} (run_id, entity_type, record_id, change_type, item, queued_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table
        );
        for item in &items {
            let body = serde_json::to_value(item)?;
            tx.execute(
                sql.as_str(),
                &[
                    &item.run_id,
                    &item.entity_type,
                    &item.record_id.encode(),
                    &item.change_type.as_str(),
                    &body,
                    &item.queued_at,
                ],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "review_queue"))?;
        }
        tx.commit()
            .await
            .map_err(|e| MigrateError::from_pg(e, "review_queue"))?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<ReviewItem>> {
        let client = self.client("reading review queue").await?;
        let rows = client
            .query(
                format!("SELECT item FROM {} ORDER BY id", self.table).as_str(),
                &[],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "review_queue"))?;
        rows.iter()
            .map(|row| -> Result<ReviewItem> {
                let body: serde_json::Value = row.try_get(0)?;
                Ok(serde_json::from_value(body)?)
            })
            .collect()
    }
}
