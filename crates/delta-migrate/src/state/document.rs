//! In-memory state document shared by the memory and file backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::error::{MigrateError, Result};
use crate::session::{Lease, RunRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StateDocument {
    #[serde(default)]
    pub runs: BTreeMap<String, RunRecord>,

    #[serde(default)]
    pub leases: BTreeMap<String, Lease>,

    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoint>,

    /// HMAC-SHA256 signature, file backend only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl StateDocument {
    pub fn save_run(&mut self, run: &RunRecord) {
        let mut stored = run.clone();
        stored.lease = None;
        self.runs.insert(stored.run_id.clone(), stored);
    }

    pub fn load_run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.get(run_id).cloned().map(|mut run| {
            run.lease = self.leases.get(run_id).cloned();
            run
        })
    }

    pub fn list_runs(&self, limit: usize) -> Vec<RunRecord> {
        let mut runs: Vec<&RunRecord> = self.runs.values().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.into_iter()
            .take(limit)
            .filter_map(|r| self.load_run(&r.run_id))
            .collect()
    }

    pub fn find_run_by_checkpoint(&self, checkpoint_id: &str) -> Option<RunRecord> {
        self.checkpoints
            .get(checkpoint_id)
            .and_then(|c| self.load_run(&c.run_id))
    }

    pub fn acquire_lease(&mut self, run_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        if !self.runs.contains_key(run_id) {
            return Err(MigrateError::NotFound(format!("run {}", run_id)));
        }
        let now = Utc::now();
        if let Some(current) = self.leases.get(run_id) {
            if current.owner != owner && current.is_live(now) {
                return Err(MigrateError::LeaseHeld {
                    run_id: run_id.to_string(),
                    owner: current.owner.clone(),
                    expires_at: current.expires_at.to_rfc3339(),
                });
            }
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MigrateError::Config(format!("Invalid lease ttl: {}", e)))?;
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        self.leases.insert(run_id.to_string(), lease.clone());
        Ok(lease)
    }

    pub fn release_lease(&mut self, run_id: &str, owner: &str) {
        if self.leases.get(run_id).map_or(false, |l| l.owner == owner) {
            self.leases.remove(run_id);
        }
    }

    pub fn insert_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if self.checkpoints.contains_key(&checkpoint.id) {
            return Err(MigrateError::Checkpoint(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        let duplicate_active = checkpoint.resumable
            && self.checkpoints.values().any(|c| {
                c.resumable
                    && c.run_id == checkpoint.run_id
                    && c.entity_type == checkpoint.entity_type
            });
        if duplicate_active {
            return Err(MigrateError::Checkpoint(format!(
                "run {} already has an active checkpoint for {}",
                checkpoint.run_id, checkpoint.entity_type
            )));
        }
        self.checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    pub fn update_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let current = self
            .checkpoints
            .get_mut(&checkpoint.id)
            .ok_or_else(|| MigrateError::NotFound(format!("checkpoint {}", checkpoint.id)))?;
        if checkpoint.records_processed < current.records_processed {
            return Err(MigrateError::Checkpoint(format!(
                "checkpoint {} would regress from {} to {} records",
                checkpoint.id, current.records_processed, checkpoint.records_processed
            )));
        }
        *current = checkpoint.clone();
        Ok(())
    }

    pub fn latest_checkpoint(&self, entity_type: &str, run_id: Option<&str>) -> Option<Checkpoint> {
        self.checkpoints
            .values()
            .filter(|c| c.entity_type == entity_type)
            .filter(|c| run_id.map_or(true, |r| c.run_id == r))
            .max_by_key(|c| c.updated_at)
            .cloned()
    }

    pub fn list_checkpoints(&self, run_id: &str) -> Vec<Checkpoint> {
        let mut list: Vec<Checkpoint> = self
            .checkpoints
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn delete_checkpoints_before(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let before = self.checkpoints.len();
        self.checkpoints
            .retain(|_, c| c.resumable || c.updated_at > cutoff);
        (before - self.checkpoints.len()) as u64
    }
}
