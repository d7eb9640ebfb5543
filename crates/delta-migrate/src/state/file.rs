//! File-based state backend.
//!
//! All runs, leases and checkpoints live in one JSON document signed with
//! HMAC-SHA256 keyed by the configuration hash. Every mutation rewrites the
//! document atomically (temp file, then rename). Leases are only meaningful
//! between executors sharing the same file on one host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::document::StateDocument;
use super::StateBackend;
use crate::checkpoint::Checkpoint;
use crate::error::{MigrateError, Result};
use crate::session::{Lease, RunRecord};

type HmacSha256 = Hmac<Sha256>;

/// State persisted to a single signed JSON file.
pub struct FileStateBackend {
    path: PathBuf,
    key: String,
    doc: Mutex<StateDocument>,
}

impl FileStateBackend {
    /// Open (or start) the state file at `path`.
    ///
    /// # Security
    ///
    /// The stored signature is verified with `config_hash` as key. A file
    /// signed under a different configuration, or edited by hand, is
    /// rejected. Unsigned files are accepted and signed on the next write.
    pub fn open<P: AsRef<Path>>(path: P, config_hash: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let doc: StateDocument = serde_json::from_str(&content)?;
            match &doc.hmac {
                Some(stored) => {
                    let expected = compute_hmac(&doc, config_hash)?;
                    if stored != &expected {
                        return Err(MigrateError::State(format!(
                            "State file integrity check failed for {}: signature mismatch \
                             (file tampered with, or written under a different config)",
                            path.display()
                        )));
                    }
                }
                None => warn!(
                    "State file {} has no integrity signature; it will be signed on next save",
                    path.display()
                ),
            }
            doc
        } else {
            StateDocument::default()
        };

        Ok(Self {
            path,
            key: config_hash.to_string(),
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn doc(&self) -> MutexGuard<'_, StateDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a copy of the document and persist it; the in-memory
    /// document only changes once the write succeeded.
    fn mutate<T>(&self, f: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        let mut guard = self.doc();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&mut next)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, doc: &mut StateDocument) -> Result<()> {
        doc.hmac = Some(compute_hmac(doc, &self.key)?);
        let content = serde_json::to_string_pretty(doc)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        debug!("State saved to {}", self.path.display());
        Ok(())
    }
}

/// Signature over the document with its own `hmac` field cleared.
fn compute_hmac(doc: &StateDocument, key: &str) -> Result<String> {
    let mut unsigned = doc.clone();
    unsigned.hmac = None;

    let content = serde_json::to_string(&unsigned)
        .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn init_schema(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.mutate(|_| Ok(()))
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.mutate(|doc| {
            doc.save_run(run);
            Ok(())
        })
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
        self.mutate(|doc| doc.acquire_lease(run_id, owner, ttl))
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.release_lease(run_id, owner);
            Ok(())
        })
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.mutate(|doc| doc.insert_checkpoint(checkpoint))
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.mutate(|doc| doc.update_checkpoint(checkpoint))
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
        self.mutate(|doc| Ok(doc.delete_checkpoints_before(cutoff)))
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
