//! Persisted run sessions.
//!
//! A [`RunRecord`] replaces any in-process registry of active migrations: it
//! lives in the state backend, so restarts and concurrent executors see the
//! same run. Each entity is in exactly one [`EntityState`] at a time, and the
//! run status is always derived from those states, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::detect::MigrationTask;
use crate::error::{ErrorKind, MigrateError, Result};

/// Per-entity lifecycle set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Derived overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    /// Terminal soft failure: nothing left to run, some work failed.
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl FromStr for RunStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(MigrateError::State(format!("Invalid run status: {}", other))),
        }
    }
}

/// A record that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Counters and state for one entity in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub state: EntityState,
    pub records_total: u64,
    /// Records in committed batches, including failed and skipped ones.
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub failed: u64,
    pub batches_committed: u64,
    pub batch_retries: u64,
    #[serde(default)]
    pub failures: Vec<RecordFailure>,
    pub checkpoint_id: Option<String>,
    /// Entity stopped at a batch boundary by pause or timeout.
    #[serde(default)]
    pub paused: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntityProgress {
    fn new(records_total: u64) -> Self {
        Self {
            state: EntityState::Pending,
            records_total,
            processed: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            deferred: 0,
            failed: 0,
            batches_committed: 0,
            batch_retries: 0,
            failures: Vec::new(),
            checkpoint_id: None,
            paused: false,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Exclusive right of one executor instance to drive a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Entity names grouped by lifecycle set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub pending: Vec<String>,
    pub running: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

/// The persisted session for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub config_hash: String,
    pub tasks: Vec<MigrationTask>,
    pub entities: BTreeMap<String, EntityProgress>,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub cancelled: bool,
    /// False once the run may no longer be resumed (non-forced cancel).
    pub resumable: bool,
    /// Run-level failure that is not attributable to one entity.
    #[serde(default)]
    pub fatal_error: Option<String>,
    /// Populated from the backend on load; not written by `save_run`.
    #[serde(default)]
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(config_hash: impl Into<String>, tasks: Vec<MigrationTask>) -> Self {
        let now = Utc::now();
        let entities = tasks
            .iter()
            .map(|t| (t.entity_type.clone(), EntityProgress::new(t.len() as u64)))
            .collect();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            config_hash: config_hash.into(),
            tasks,
            entities,
            pause_requested: false,
            cancel_requested: false,
            cancelled: false,
            resumable: true,
            fatal_error: None,
            lease: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Overall status, derived from entity states and control flags.
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            return RunStatus::Cancelled;
        }
        if self.fatal_error.is_some() && !self.any_in(EntityState::Running) {
            return RunStatus::Failed;
        }
        if self.any_in(EntityState::Running) {
            return RunStatus::Running;
        }
        if self.any_in(EntityState::Pending) {
            return if self.started_at.is_some() {
                RunStatus::Paused
            } else {
                RunStatus::Queued
            };
        }

        let failed_entities = self.count_in(EntityState::Failed);
        if failed_entities > 0 && failed_entities == self.entities.len() {
            return RunStatus::Failed;
        }
        if failed_entities > 0 || self.total_failed() > 0 || self.total_deferred() > 0 {
            return RunStatus::Partial;
        }
        RunStatus::Completed
    }

    fn any_in(&self, state: EntityState) -> bool {
        self.entities.values().any(|e| e.state == state)
    }

    fn count_in(&self, state: EntityState) -> usize {
        self.entities.values().filter(|e| e.state == state).count()
    }

    /// Move an entity to a new set.
    pub fn transition(&mut self, entity_type: &str, state: EntityState) -> Result<()> {
        let now = Utc::now();
        let progress = self
            .entities
            .get_mut(entity_type)
            .ok_or_else(|| MigrateError::UnknownEntity(entity_type.to_string()))?;
        progress.state = state;
        match state {
            EntityState::Running => {
                progress.paused = false;
                progress.started_at.get_or_insert(now);
            }
            EntityState::Completed | EntityState::Failed => progress.finished_at = Some(now),
            EntityState::Pending => {}
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn entity(&self, entity_type: &str) -> Result<&EntityProgress> {
        self.entities
            .get(entity_type)
            .ok_or_else(|| MigrateError::UnknownEntity(entity_type.to_string()))
    }

    pub fn entity_mut(&mut self, entity_type: &str) -> Result<&mut EntityProgress> {
        self.entities
            .get_mut(entity_type)
            .ok_or_else(|| MigrateError::UnknownEntity(entity_type.to_string()))
    }

    pub fn task(&self, entity_type: &str) -> Option<&MigrationTask> {
        self.tasks.iter().find(|t| t.entity_type == entity_type)
    }

    /// Entity names grouped by set.
    pub fn sets(&self) -> MigrationStatus {
        let mut sets = MigrationStatus::default();
        for (name, progress) in &self.entities {
            let bucket = match progress.state {
                EntityState::Pending => &mut sets.pending,
                EntityState::Running => &mut sets.running,
                EntityState::Completed => &mut sets.completed,
                EntityState::Failed => &mut sets.failed,
            };
            bucket.push(name.clone());
        }
        sets
    }

    pub fn total_records(&self) -> u64 {
        self.entities.values().map(|e| e.records_total).sum()
    }

    pub fn total_processed(&self) -> u64 {
        self.entities.values().map(|e| e.processed).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.entities.values().map(|e| e.failed).sum()
    }

    pub fn total_deferred(&self) -> u64 {
        self.entities.values().map(|e| e.deferred).sum()
    }

    /// Whether execution can continue from where it stopped. A forced
    /// cancel leaves the run resumable.
    pub fn can_resume(&self) -> bool {
        self.resumable && self.status() != RunStatus::Completed
    }

    /// Reset failed entities to pending so a resume retries them.
    pub fn requeue_failed(&mut self) {
        for progress in self.entities.values_mut() {
            if progress.state == EntityState::Failed {
                progress.state = EntityState::Pending;
                progress.error = None;
                progress.finished_at = None;
            }
        }
        self.fatal_error = None;
        self.completed_at = None;
        self.updated_at = Utc::now();
    }

    /// Adopt pause/cancel requests persisted by another process.
    pub fn merge_control(&mut self, stored: &RunRecord) {
        if stored.cancel_requested && !self.cancel_requested {
            self.cancel_requested = true;
            self.resumable = stored.resumable;
        }
        self.pause_requested |= stored.pause_requested;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
