//! Pre-resolution snapshots of destination rows, for manual rollback.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::core::Row;
use crate::error::Result;

/// Receives destination rows about to be overwritten or deleted.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn snapshot(&self, run_id: &str, entity_type: &str, rows: &[Row]) -> Result<()>;
}

/// Keeps snapshots in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotSink {
    snapshots: Mutex<Vec<(String, Vec<Row>)>>,
}

impl MemorySnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots taken so far as `(entity_type, rows)`.
    pub fn snapshots(&self) -> Vec<(String, Vec<Row>)> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SnapshotSink for MemorySnapshotSink {
    async fn snapshot(&self, _run_id: &str, entity_type: &str, rows: &[Row]) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((entity_type.to_string(), rows.to_vec()));
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotFile<'a> {
    run_id: &'a str,
    entity_type: &'a str,
    taken_at: chrono::DateTime<Utc>,
    rows: &'a [Row],
}

/// Writes one JSON file per snapshot into a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotSink {
    dir: PathBuf,
}

impl FileSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SnapshotSink for FileSnapshotSink {
    async fn snapshot(&self, run_id: &str, entity_type: &str, rows: &[Row]) -> Result<()> {
        let taken_at = Utc::now();
        let body = serde_json::to_vec_pretty(&SnapshotFile {
            run_id,
            entity_type,
            taken_at,
            rows,
        })?;
        let path = self.dir.join(format!(
            "{}-{}-{}.json",
            run_id,
            entity_type,
            taken_at.format("%Y%m%dT%H%M%S%.6f")
        ));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_snapshot_written() {
        let dir = tempdir().unwrap();
        let sink = FileSnapshotSink::new(dir.path().join("snapshots"));
        let row = Row::from_json(json!({"id": "n-1", "name": "Old"})).unwrap();
        sink.snapshot("run-1", "doctor", &[row]).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("snapshots"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("\"Old\""));
    }
}
