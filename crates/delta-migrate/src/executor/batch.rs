//! Batch execution with retry and bisection.
//!
//! Two failure classes are kept apart here:
//! - transient errors (connection, pool) retry the same batch with
//!   exponential backoff, then escalate;
//! - destination constraint errors roll the batch back and retry its halves
//!   until the offending records are isolated at the minimum batch size,
//!   where they are recorded as failed.
//!
//! Record-level failures never reach this layer; the resolver reports them
//! inside a successful [`BatchOutcome`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::core::RecordKey;
use crate::detect::MigrationTask;
use crate::error::{MigrateError, Result};
use crate::resolve::{BatchOutcome, ConflictResolver};
use crate::session::RecordFailure;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            max_retries: sync.get_max_retries() as usize,
            base_delay: sync.get_retry_base_delay(),
            max_delay: sync.get_retry_max_delay(),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Batch result plus the number of retries it took.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    pub retries: u64,
}

type BoxedRun<'a> = Pin<Box<dyn Future<Output = Result<BatchReport>> + Send + 'a>>;

/// Runs one batch of an entity through the resolver.
pub struct BatchRunner {
    resolver: Arc<ConflictResolver>,
    retry: RetryPolicy,
    min_batch_size: usize,
}

impl BatchRunner {
    pub fn new(resolver: Arc<ConflictResolver>, retry: RetryPolicy, min_batch_size: usize) -> Self {
        Self {
            resolver,
            retry,
            min_batch_size: min_batch_size.max(1),
        }
    }

    /// Apply `ids` and return the merged outcome.
    ///
    /// An error means the batch could not be committed even after retries
    /// and the entity should fail.
    pub async fn run(&self, run_id: &str, task: &MigrationTask, ids: &[RecordKey]) -> Result<BatchReport> {
        self.run_at_depth(run_id, task, ids, 0).await
    }

    fn run_at_depth<'a>(
        &'a self,
        run_id: &'a str,
        task: &'a MigrationTask,
        ids: &'a [RecordKey],
        depth: usize,
    ) -> BoxedRun<'a> {
        Box::pin(async move {
            let entity = task.entity_type.as_str();
            let mut retries = 0u64;
            let mut attempt = 0usize;
            loop {
                match self.resolver.apply_batch(run_id, task, ids).await {
                    Ok(outcome) => return Ok(BatchReport { outcome, retries }),
                    Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                        attempt += 1;
                        retries += 1;
                        let delay = self.retry.delay(attempt);
                        warn!(
                            entity,
                            attempt,
                            max_retries = self.retry.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Retryable error, will retry: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) if e.is_batch_reducible() => {
                        return self.reduce(run_id, task, ids, depth, e, retries).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    async fn reduce(
        &self,
        run_id: &str,
        task: &MigrationTask,
        ids: &[RecordKey],
        depth: usize,
        cause: MigrateError,
        mut retries: u64,
    ) -> Result<BatchReport> {
        let entity = task.entity_type.as_str();
        if ids.len() <= self.min_batch_size {
            warn!(entity, size = ids.len(), "batch failed at minimum size: {}", cause);
            return Ok(BatchReport {
                outcome: failed_outcome(ids, &cause),
                retries,
            });
        }

        let delay = self.retry.delay(depth + 1);
        debug!(
            entity,
            size = ids.len(),
            depth,
            delay_ms = delay.as_millis() as u64,
            "batch rolled back, retrying in halves: {}",
            cause
        );
        tokio::time::sleep(delay).await;

        let mid = ids.len() / 2;
        let mut merged = BatchReport::default();
        for half in [&ids[..mid], &ids[mid..]] {
            retries += 1;
            let report = self.run_at_depth(run_id, task, half, depth + 1).await?;
            merged.outcome.merge(report.outcome);
            merged.retries += report.retries;
        }
        merged.retries += retries;
        Ok(merged)
    }
}

/// Every record of an unappliable batch, counted as failed.
fn failed_outcome(ids: &[RecordKey], cause: &MigrateError) -> BatchOutcome {
    BatchOutcome {
        records: ids.len() as u64,
        failures: ids
            .iter()
            .map(|id| RecordFailure {
                record_id: id.to_string(),
                kind: cause.kind(),
                message: cause.to_string(),
            })
            .collect(),
        last_key: ids.last().cloned(),
        ..Default::default()
    }
}
