//! Execution results and recovery guidance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::session::{EntityProgress, EntityState, RecordFailure, RunRecord, RunStatus};

/// Outcome for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_type: String,
    pub state: EntityState,
    pub records_total: u64,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub failed: u64,
    pub batches_committed: u64,
    pub batch_retries: u64,
    pub failures: Vec<RecordFailure>,
    pub checkpoint_id: Option<String>,
    pub error: Option<String>,
}

impl EntityOutcome {
    fn from_progress(entity_type: &str, p: &EntityProgress) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            state: p.state,
            records_total: p.records_total,
            processed: p.processed,
            inserted: p.inserted,
            updated: p.updated,
            deleted: p.deleted,
            skipped: p.skipped,
            deferred: p.deferred,
            failed: p.failed,
            batches_committed: p.batches_committed,
            batch_retries: p.batch_retries,
            failures: p.failures.clone(),
            checkpoint_id: p.checkpoint_id.clone(),
            error: p.error.clone(),
        }
    }
}

/// What an operator should do with a run that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Resume the run; it continues after the last checkpoint.
    Resume,
    /// Fix the failing records at the source, then run detection again.
    RetryFailedRecords,
    /// Work through the manual review queue.
    ReviewDeferred,
    /// The run can't continue; submit a new one.
    StartNewRun,
}

/// Where and how to recover a run that is not `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryBlock {
    /// Resumable checkpoint to continue from, or the most relevant audit
    /// checkpoint when none is resumable.
    pub checkpoint_id: Option<String>,
    pub resumable: bool,
    pub recommended_action: RecommendedAction,
    pub message: String,
}

/// Result of executing (part of) a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: RunStatus,
    pub entities: Vec<EntityOutcome>,
    pub records_total: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_deferred: u64,
    /// Checkpoints created by the run, oldest first.
    pub checkpoints: Vec<String>,
    pub recovery: Option<RecoveryBlock>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub records_per_second: f64,
}

impl ExecutionResult {
    pub fn from_run(run: &RunRecord, checkpoints: &[Checkpoint]) -> Self {
        let status = run.status();
        let ended = run.completed_at.unwrap_or(run.updated_at);
        let duration_seconds = run
            .started_at
            .map(|s| (ended - s).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let records_processed = run.total_processed();
        let records_per_second = if duration_seconds > 0.0 {
            records_processed as f64 / duration_seconds
        } else {
            0.0
        };

        Self {
            run_id: run.run_id.clone(),
            status,
            entities: run
                .entities
                .iter()
                .map(|(name, p)| EntityOutcome::from_progress(name, p))
                .collect(),
            records_total: run.total_records(),
            records_processed,
            records_failed: run.total_failed(),
            records_deferred: run.total_deferred(),
            checkpoints: checkpoints.iter().map(|c| c.id.clone()).collect(),
            recovery: recovery_for(run, status, checkpoints),
            error: run.fatal_error.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_seconds,
            records_per_second,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn recovery_for(run: &RunRecord, status: RunStatus, checkpoints: &[Checkpoint]) -> Option<RecoveryBlock> {
    if status == RunStatus::Completed {
        return None;
    }

    let resumable = checkpoints.iter().find(|c| {
        c.resumable
            && run
                .entities
                .get(&c.entity_type)
                .map_or(false, |e| e.state != EntityState::Completed)
    });
    // Fall back to the latest checkpoint of an entity with failed records.
    let audit = || {
        checkpoints
            .iter()
            .filter(|c| run.entities.get(&c.entity_type).map_or(false, |e| e.failed > 0))
            .max_by_key(|c| c.updated_at)
    };
    let checkpoint_id = resumable.or_else(audit).map(|c| c.id.clone());

    let any_failed_entity = run.entities.values().any(|e| e.state == EntityState::Failed);
    let (action, message) = match status {
        RunStatus::Cancelled if !run.can_resume() => (
            RecommendedAction::StartNewRun,
            "run was cancelled and is not resumable".to_string(),
        ),
        RunStatus::Cancelled => (
            RecommendedAction::Resume,
            "run was force-cancelled; resume continues after the last checkpoint".to_string(),
        ),
        RunStatus::Paused | RunStatus::Queued | RunStatus::Running => (
            RecommendedAction::Resume,
            "run stopped at a batch boundary; resume continues after the last checkpoint".to_string(),
        ),
        _ if any_failed_entity => (
            RecommendedAction::Resume,
            format!(
                "{} entities failed; resume retries them from their checkpoints",
                run.sets().failed.len()
            ),
        ),
        _ if run.total_failed() > 0 => (
            RecommendedAction::RetryFailedRecords,
            format!(
                "{} records failed; fix them at the source and run detection again",
                run.total_failed()
            ),
        ),
        _ if run.total_deferred() > 0 => (
            RecommendedAction::ReviewDeferred,
            format!("{} records are waiting for manual review", run.total_deferred()),
        ),
        _ => (
            RecommendedAction::Resume,
            run.fatal_error
                .clone()
                .unwrap_or_else(|| "run did not complete".to_string()),
        ),
    };

    Some(RecoveryBlock {
        checkpoint_id,
        resumable: resumable.is_some() && run.can_resume(),
        recommended_action: action,
        message,
    })
}
