//! Migration executor - dependency-ordered, checkpointed batch execution.
//!
//! A run's tasks are split into dependency waves. Waves run one after the
//! other; inside a wave, entities run concurrently up to
//! `max_concurrent_entities`; inside an entity, batches run strictly in
//! ascending key order. Pause, cancel, timeout and lease checks happen only
//! between batches.

mod batch;
mod control;
pub mod plan;
mod result;

pub use batch::{BatchReport, BatchRunner, RetryPolicy};
pub use control::{ControlSignal, RunControl};
pub use plan::{dependency_waves, WaveNode};
pub use result::{EntityOutcome, ExecutionResult, RecommendedAction, RecoveryBlock};

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointProgress, CheckpointStatus};
use crate::config::SyncConfig;
use crate::error::{MigrateError, Result};
use crate::progress::ProgressTracker;
use crate::resolve::ConflictResolver;
use crate::session::{EntityState, RunRecord};
use crate::state::StateBackend;

/// Executor tuning, normally taken from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub batch_size: usize,
    pub min_batch_size: usize,
    /// Committed batches between checkpoint writes.
    pub checkpoint_interval: usize,
    pub max_concurrent_entities: usize,
    pub run_timeout: Option<Duration>,
    pub lease_ttl: Duration,
    /// Lease owner identity of this executor instance.
    pub owner: String,
    pub retry: RetryPolicy,
}

impl ExecutorOptions {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            batch_size: sync.get_batch_size(),
            min_batch_size: sync.get_min_batch_size(),
            checkpoint_interval: sync.get_checkpoint_interval(),
            max_concurrent_entities: sync.get_max_concurrent_entities(),
            run_timeout: sync.get_run_timeout(),
            lease_ttl: sync.get_lease_ttl(),
            owner: default_owner(),
            retry: RetryPolicy::from_config(sync),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

fn default_owner() -> String {
    format!("executor-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

/// Why an entity (and then the run) stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Pause,
    Cancel { force: bool },
    Timeout,
    /// Another entity hit a run-fatal error.
    Abort,
}

impl Stop {
    fn as_str(&self) -> &'static str {
        match self {
            Stop::Pause => "pause",
            Stop::Cancel { .. } => "cancel",
            Stop::Timeout => "timeout",
            Stop::Abort => "abort",
        }
    }
}

/// State shared by the entity workers of one execution.
struct Shared {
    run_id: String,
    run: Mutex<RunRecord>,
    deadline: Option<Instant>,
    abort: CancellationToken,
}

/// Drives persisted runs to completion.
#[derive(Clone)]
pub struct MigrationExecutor {
    options: ExecutorOptions,
    state: Arc<dyn StateBackend>,
    checkpoints: CheckpointManager,
    runner: Arc<BatchRunner>,
    progress: Option<ProgressTracker>,
}

impl MigrationExecutor {
    pub fn new(
        options: ExecutorOptions,
        resolver: Arc<ConflictResolver>,
        state: Arc<dyn StateBackend>,
    ) -> Self {
        let runner = Arc::new(BatchRunner::new(
            resolver,
            options.retry,
            options.min_batch_size,
        ));
        Self {
            checkpoints: CheckpointManager::new(state.clone()),
            options,
            state,
            runner,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.progress = Some(tracker);
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Execute every pending entity of a persisted run.
    ///
    /// Returns once all waves finished or the run stopped at a batch
    /// boundary (pause, cancel, timeout, fatal error). The run's lease is
    /// held for the whole call.
    pub async fn execute(
        &self,
        run_id: &str,
        control: watch::Receiver<ControlSignal>,
    ) -> Result<ExecutionResult> {
        let result = self.execute_run(run_id, control).await;
        // A finished run has already published its final snapshot.
        if let Some(tracker) = &self.progress {
            tracker.release(run_id);
        }
        result
    }

    async fn execute_run(
        &self,
        run_id: &str,
        control: watch::Receiver<ControlSignal>,
    ) -> Result<ExecutionResult> {
        let mut run = self
            .state
            .load_run(run_id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("run {}", run_id)))?;

        if run.cancelled {
            info!(run_id, "run is cancelled; nothing to execute");
            return self.result(&run).await;
        }

        let lease = self
            .state
            .try_acquire_lease(run_id, &self.options.owner, self.options.lease_ttl)
            .await?;
        debug!(run_id, owner = %lease.owner, expires_at = %lease.expires_at, "lease acquired");
        run.lease = Some(lease);

        let nodes: Vec<WaveNode> = run
            .tasks
            .iter()
            .map(|t| WaveNode {
                name: t.entity_type.clone(),
                dependencies: t.dependencies.clone(),
                priority: t.priority,
            })
            .collect();
        let waves = match dependency_waves(&nodes) {
            Ok(waves) => waves,
            Err(e) => {
                self.release_lease(run_id).await;
                return Err(e);
            }
        };

        // We hold the lease, so anything still marked running was left
        // behind by a crashed executor and resumes from its checkpoint.
        let stale: Vec<String> = run.sets().running;
        for entity in &stale {
            run.transition(entity, EntityState::Pending)?;
        }
        run.pause_requested = false;
        run.started_at.get_or_insert_with(Utc::now);
        run.completed_at = None;
        run.touch();
        self.state.save_run(&run).await?;

        info!(
            run_id,
            entities = run.entities.len(),
            waves = waves.len(),
            records = run.total_records(),
            "Starting run execution"
        );
        if let Some(tracker) = &self.progress {
            tracker.start_run(run_id, run.total_records(), run.total_processed());
        }

        let shared = Arc::new(Shared {
            run_id: run_id.to_string(),
            run: Mutex::new(run),
            deadline: self.options.run_timeout.map(|t| Instant::now() + t),
            abort: CancellationToken::new(),
        });

        let mut stop = None;
        for (index, wave) in waves.iter().enumerate() {
            if let Some(reason) = self.check_stop(&shared, &control).await {
                stop = Some(reason);
                break;
            }
            let runnable = self.prepare_wave(&shared, wave).await;
            if runnable.is_empty() {
                continue;
            }
            debug!(run_id, wave = index + 1, entities = ?runnable, "dispatching wave");

            let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_entities.max(1)));
            let mut handles = Vec::new();
            for entity in runnable {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| MigrateError::State(format!("worker pool closed: {}", e)))?;
                let this = self.clone();
                let shared = shared.clone();
                let control = control.clone();
                let name = entity.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    this.run_entity(&shared, &name, control).await
                });
                handles.push((entity, handle));
            }

            // Wave barrier: the next wave waits for every entity here.
            let (names, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
            for (entity, joined) in names.into_iter().zip(join_all(handles).await) {
                match joined {
                    Ok(Some(reason)) => {
                        stop.get_or_insert(reason);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(run_id, entity = %entity, "entity task panicked: {}", e);
                        let mut run = shared.run.lock().await;
                        if let Ok(progress) = run.entity_mut(&entity) {
                            progress.error = Some(format!("task panicked: {}", e));
                        }
                        let _ = run.transition(&entity, EntityState::Failed);
                        self.save_logged(&mut run).await;
                    }
                }
            }
            if stop.is_some() {
                break;
            }
        }

        self.finish(&shared, stop).await
    }

    /// Pending entities of a wave that may start. Entities whose
    /// dependency failed are failed here instead of being started.
    async fn prepare_wave(&self, shared: &Shared, wave: &[String]) -> Vec<String> {
        let mut run = shared.run.lock().await;
        let mut runnable = Vec::new();
        let mut blocked = false;
        for entity in wave {
            let pending = run
                .entities
                .get(entity)
                .map_or(false, |p| p.state == EntityState::Pending);
            if !pending {
                continue;
            }
            let failed_dependency = run.task(entity).and_then(|task| {
                task.dependencies
                    .iter()
                    .find(|d| {
                        run.entities
                            .get(d.as_str())
                            .map_or(false, |p| p.state == EntityState::Failed)
                    })
                    .cloned()
            });
            match failed_dependency {
                Some(dependency) => {
                    warn!(run_id = %shared.run_id, entity = %entity, dependency = %dependency, "blocked by failed dependency");
                    if let Ok(progress) = run.entity_mut(entity) {
                        progress.error = Some(format!("dependency '{}' failed", dependency));
                    }
                    let _ = run.transition(entity, EntityState::Failed);
                    blocked = true;
                }
                None => runnable.push(entity.clone()),
            }
        }
        if blocked {
            self.save_logged(&mut run).await;
        }
        runnable
    }

    /// Process one entity's batches. Returns why it stopped early, if it did.
    async fn run_entity(
        &self,
        shared: &Shared,
        entity: &str,
        control: watch::Receiver<ControlSignal>,
    ) -> Option<Stop> {
        let run_id = shared.run_id.as_str();
        let task = {
            let mut run = shared.run.lock().await;
            let task = run.task(entity)?.clone();
            if let Err(e) = run.transition(entity, EntityState::Running) {
                warn!(run_id, entity, "cannot start entity: {}", e);
                return None;
            }
            self.save_logged(&mut run).await;
            task
        };
        if let Some(tracker) = &self.progress {
            tracker.entity_started(run_id, entity);
        }

        // Entity boundary: a checkpoint failure here is fatal to the run.
        let checkpoint = match self
            .checkpoints
            .create(run_id, entity, task.len() as u64)
            .await
        {
            Ok(c) => c,
            Err(e) => return self.fatal(shared, entity, e).await,
        };
        {
            let mut run = shared.run.lock().await;
            if let Ok(progress) = run.entity_mut(entity) {
                progress.checkpoint_id = Some(checkpoint.id.clone());
                progress.processed = checkpoint.records_processed;
                progress.batches_committed = checkpoint.batches_committed;
            }
        }

        let mut last_key = checkpoint.last_processed_key.clone();
        let mut processed = checkpoint.records_processed;
        let mut batches = checkpoint.batches_committed;
        let mut since_checkpoint = 0usize;
        let remaining = task.ids_after(last_key.as_ref());
        info!(
            run_id,
            entity,
            records = task.len(),
            remaining = remaining.len(),
            resumed = last_key.is_some(),
            "entity started"
        );

        for chunk in remaining.chunks(self.options.batch_size.max(1)) {
            if let Some(reason) = self.check_stop(shared, &control).await {
                let at = CheckpointProgress {
                    status: CheckpointStatus::Paused,
                    last_processed_key: last_key.clone(),
                    records_processed: processed,
                    batches_committed: batches,
                };
                return self.stop_entity(shared, entity, &checkpoint.id, reason, at).await;
            }

            let report = match self.runner.run(run_id, &task, chunk).await {
                Ok(report) => report,
                Err(e) => {
                    let at = (since_checkpoint > 0).then(|| CheckpointProgress {
                        status: CheckpointStatus::Running,
                        last_processed_key: last_key.clone(),
                        records_processed: processed,
                        batches_committed: batches,
                    });
                    return self.fail_entity(shared, entity, &checkpoint.id, at, e).await;
                }
            };

            let outcome = report.outcome;
            processed += outcome.records;
            batches += 1;
            since_checkpoint += 1;
            if outcome.last_key.is_some() {
                last_key = outcome.last_key.clone();
            }
            debug!(
                run_id,
                entity,
                batch = batches,
                inserted = outcome.inserted,
                updated = outcome.updated,
                deleted = outcome.deleted,
                skipped = outcome.skipped,
                failed = outcome.failed(),
                "batch committed"
            );
            if let Some(tracker) = &self.progress {
                tracker.record_batch(run_id, outcome.records, outcome.failed());
            }
            {
                let mut run = shared.run.lock().await;
                if let Ok(progress) = run.entity_mut(entity) {
                    progress.processed = processed;
                    progress.batches_committed = batches;
                    progress.batch_retries += report.retries;
                    progress.inserted += outcome.inserted;
                    progress.updated += outcome.updated;
                    progress.deleted += outcome.deleted;
                    progress.skipped += outcome.skipped;
                    progress.deferred += outcome.deferred;
                    progress.failed += outcome.failed();
                    progress.failures.extend(outcome.failures);
                }
                self.save_logged(&mut run).await;
            }

            if since_checkpoint >= self.options.checkpoint_interval.max(1) {
                since_checkpoint = 0;
                let at = CheckpointProgress {
                    status: CheckpointStatus::Running,
                    last_processed_key: last_key.clone(),
                    records_processed: processed,
                    batches_committed: batches,
                };
                if let Err(e) = self.checkpoints.update(&checkpoint.id, at).await {
                    return self.fail_entity(shared, entity, &checkpoint.id, None, e).await;
                }
            }

            if let Err(e) = self
                .state
                .try_acquire_lease(run_id, &self.options.owner, self.options.lease_ttl)
                .await
            {
                match e {
                    MigrateError::LeaseHeld { .. } => return self.fatal(shared, entity, e).await,
                    other => warn!(run_id, entity, "lease renewal failed: {}", other),
                }
            }
        }

        // Entity boundary again.
        let done = CheckpointProgress {
            status: CheckpointStatus::Completed,
            last_processed_key: last_key,
            records_processed: processed,
            batches_committed: batches,
        };
        if let Err(e) = self.checkpoints.update(&checkpoint.id, done).await {
            return self.fatal(shared, entity, e).await;
        }
        if let Err(e) = self.checkpoints.complete(&checkpoint.id).await {
            return self.fatal(shared, entity, e).await;
        }

        let mut run = shared.run.lock().await;
        let _ = run.transition(entity, EntityState::Completed);
        self.save_logged(&mut run).await;
        if let Ok(progress) = run.entity(entity) {
            info!(
                run_id,
                entity,
                processed = progress.processed,
                inserted = progress.inserted,
                updated = progress.updated,
                deleted = progress.deleted,
                failed = progress.failed,
                "entity completed"
            );
        }
        drop(run);
        if let Some(tracker) = &self.progress {
            tracker.entity_finished(run_id, entity);
        }
        None
    }

    /// Checked between batches: abort, local signal, timeout, persisted flags.
    async fn check_stop(
        &self,
        shared: &Shared,
        control: &watch::Receiver<ControlSignal>,
    ) -> Option<Stop> {
        if shared.abort.is_cancelled() {
            return Some(Stop::Abort);
        }
        let signal = *control.borrow();
        match signal {
            ControlSignal::Pause => return Some(Stop::Pause),
            ControlSignal::Cancel { force } => return Some(Stop::Cancel { force }),
            ControlSignal::Run => {}
        }
        if shared.deadline.map_or(false, |d| Instant::now() >= d) {
            return Some(Stop::Timeout);
        }

        // Requests made through the state backend by another process.
        match self.state.load_run(&shared.run_id).await {
            Ok(Some(stored)) => {
                let mut run = shared.run.lock().await;
                run.merge_control(&stored);
                if run.cancel_requested {
                    return Some(Stop::Cancel {
                        force: run.resumable,
                    });
                }
                run.pause_requested.then_some(Stop::Pause)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(run_id = %shared.run_id, "cannot read run control flags: {}", e);
                None
            }
        }
    }

    async fn stop_entity(
        &self,
        shared: &Shared,
        entity: &str,
        checkpoint_id: &str,
        reason: Stop,
        at: CheckpointProgress,
    ) -> Option<Stop> {
        let processed = at.records_processed;
        if let Err(e) = self.checkpoints.update(checkpoint_id, at).await {
            return self.fatal(shared, entity, e).await;
        }
        let mut run = shared.run.lock().await;
        let _ = run.transition(entity, EntityState::Pending);
        if let Ok(progress) = run.entity_mut(entity) {
            progress.paused = true;
        }
        self.save_logged(&mut run).await;
        drop(run);
        if let Some(tracker) = &self.progress {
            tracker.entity_finished(&shared.run_id, entity);
        }
        info!(
            run_id = %shared.run_id,
            entity,
            reason = reason.as_str(),
            processed,
            "entity stopped at batch boundary"
        );
        Some(reason)
    }

    async fn fail_entity(
        &self,
        shared: &Shared,
        entity: &str,
        checkpoint_id: &str,
        at: Option<CheckpointProgress>,
        err: MigrateError,
    ) -> Option<Stop> {
        error!(run_id = %shared.run_id, entity, "entity failed: {}", err);
        if let Some(at) = at {
            if let Err(e) = self.checkpoints.update(checkpoint_id, at).await {
                warn!(run_id = %shared.run_id, entity, "checkpoint before failure not written: {}", e);
            }
        }
        if let Err(e) = self.checkpoints.fail(checkpoint_id).await {
            return self.fatal(shared, entity, e).await;
        }
        let mut run = shared.run.lock().await;
        if let Ok(progress) = run.entity_mut(entity) {
            progress.error = Some(err.to_string());
        }
        let _ = run.transition(entity, EntityState::Failed);
        self.save_logged(&mut run).await;
        drop(run);
        if let Some(tracker) = &self.progress {
            tracker.entity_finished(&shared.run_id, entity);
        }
        None
    }

    /// Fail the entity and abort the rest of the run.
    async fn fatal(&self, shared: &Shared, entity: &str, err: MigrateError) -> Option<Stop> {
        error!(run_id = %shared.run_id, entity, "fatal error, aborting run: {}", err);
        let mut run = shared.run.lock().await;
        run.fatal_error.get_or_insert_with(|| err.to_string());
        if let Ok(progress) = run.entity_mut(entity) {
            progress.error = Some(err.to_string());
        }
        let _ = run.transition(entity, EntityState::Failed);
        self.save_logged(&mut run).await;
        drop(run);
        shared.abort.cancel();
        if let Some(tracker) = &self.progress {
            tracker.entity_finished(&shared.run_id, entity);
        }
        Some(Stop::Abort)
    }

    async fn finish(&self, shared: &Shared, stop: Option<Stop>) -> Result<ExecutionResult> {
        let run_id = shared.run_id.as_str();
        let mut run = shared.run.lock().await.clone();

        match stop {
            Some(Stop::Cancel { force }) => {
                run.cancelled = true;
                run.resumable = force;
                if !force {
                    let retired = self.checkpoints.retire_run(run_id).await?;
                    debug!(run_id, retired, "checkpoints retired after cancel");
                }
                warn!(run_id, force, "run cancelled");
            }
            Some(Stop::Timeout) => {
                warn!(run_id, "run timeout elapsed; remaining entities stay resumable")
            }
            Some(Stop::Pause) => info!(run_id, "run paused"),
            Some(Stop::Abort) | None => {}
        }

        let status = run.status();
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        let saved = self.save(&mut run).await;
        self.release_lease(run_id).await;
        saved?;

        if let Some(tracker) = &self.progress {
            tracker.finish_run(run_id, status);
        }

        let result = self.result(&run).await?;
        info!(
            run_id,
            status = status.as_str(),
            processed = result.records_processed,
            failed = result.records_failed,
            duration_seconds = result.duration_seconds,
            "Run {}: {} records processed, {} failed",
            status.as_str(),
            result.records_processed,
            result.records_failed
        );
        Ok(result)
    }

    async fn result(&self, run: &RunRecord) -> Result<ExecutionResult> {
        let checkpoints = self.checkpoints.list_for_run(&run.run_id).await?;
        Ok(ExecutionResult::from_run(run, &checkpoints))
    }

    /// Save the in-memory record without losing control requests that
    /// were persisted since it was loaded.
    async fn save(&self, run: &mut RunRecord) -> Result<()> {
        if let Ok(Some(stored)) = self.state.load_run(&run.run_id).await {
            run.merge_control(&stored);
        }
        run.touch();
        self.state.save_run(run).await
    }

    /// Progress saves between batches; the checkpoint is the resume
    /// authority, so a failed save is only logged.
    async fn save_logged(&self, run: &mut RunRecord) {
        if let Err(e) = self.save(run).await {
            warn!(run_id = %run.run_id, "run state not saved: {}", e);
        }
    }

    async fn release_lease(&self, run_id: &str) {
        if let Err(e) = self.state.release_lease(run_id, &self.options.owner).await {
            warn!(run_id, "lease release failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RecordKey, Row, TableRef};
    use crate::detect::{ChangeType, MigrationTask};
    use crate::resolve::ConflictPolicy;
    use crate::schema::{EntityDescriptor, PassThrough, SchemaRegistry};
    use crate::session::RunStatus;
    use crate::state::MemoryStateBackend;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        source: MemoryStore,
        dest: MemoryStore,
        state: Arc<MemoryStateBackend>,
        executor: MigrationExecutor,
    }

    fn table(schema: &str, name: &str) -> TableRef {
        TableRef::new(schema, name)
    }

    fn fixture(batch_size: usize) -> Fixture {
        let source = MemoryStore::new();
        let dest = MemoryStore::new();
        let registry = SchemaRegistry::new()
            .with_entity(
                EntityDescriptor::new(
                    "clinic",
                    table("legacy", "clinics"),
                    table("public", "clinics"),
                    "clinic_id",
                ),
                Arc::new(PassThrough),
            )
            .unwrap()
            .with_entity(
                EntityDescriptor::new(
                    "doctor",
                    table("legacy", "doctors"),
                    table("public", "doctors"),
                    "doctor_id",
                )
                .with_dependencies(&["clinic"]),
                Arc::new(PassThrough),
            )
            .unwrap();
        let resolver = Arc::new(ConflictResolver::new(
            ConflictPolicy::SourceWins,
            Arc::new(registry),
            Arc::new(source.clone()),
            Arc::new(dest.clone()),
        ));
        let state = Arc::new(MemoryStateBackend::new());
        let options = ExecutorOptions {
            batch_size,
            min_batch_size: 1,
            checkpoint_interval: 1,
            max_concurrent_entities: 2,
            run_timeout: None,
            lease_ttl: Duration::from_secs(60),
            owner: "test-executor".into(),
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        };
        let executor = MigrationExecutor::new(options, resolver, state.clone());
        Fixture {
            source,
            dest,
            state,
            executor,
        }
    }

    fn seed(fx: &Fixture, entity: &str, field: &str, n: i64) -> MigrationTask {
        let src = table("legacy", &format!("{}s", entity));
        let mut ids = Vec::new();
        for i in 1..=n {
            fx.source
                .insert_row(&src, Row::from_json(json!({ field: i, "name": format!("{entity}-{i}") })).unwrap());
            ids.push(RecordKey::from(i));
        }
        let mut task = MigrationTask::new(entity, ids.clone());
        for id in ids {
            task.change_hints.insert(id, ChangeType::New);
        }
        task
    }

    async fn submit(fx: &Fixture, tasks: Vec<MigrationTask>) -> String {
        let run = RunRecord::new("hash", tasks);
        fx.state.save_run(&run).await.unwrap();
        run.run_id
    }

    #[tokio::test]
    async fn test_run_completes_and_retains_audit_checkpoints() {
        let fx = fixture(2);
        let clinics = seed(&fx, "clinic", "clinic_id", 3);
        let doctors = seed(&fx, "doctor", "doctor_id", 5).with_dependencies(&["clinic"]);
        let run_id = submit(&fx, vec![doctors, clinics]).await;

        let result = fx
            .executor
            .execute(&run_id, RunControl::new().subscribe())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.records_processed, 8);
        assert!(result.recovery.is_none());
        assert_eq!(fx.dest.rows(&table("public", "doctors")).len(), 5);
        assert_eq!(result.checkpoints.len(), 2);
        let cps = fx.executor.checkpoints().list_for_run(&run_id).await.unwrap();
        assert!(cps.iter().all(|c| !c.resumable && c.status == CheckpointStatus::Completed));

        let stored = fx.state.load_run(&run_id).await.unwrap().unwrap();
        assert!(stored.lease.is_none());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_parent_blocks_dependent_wave() {
        let fx = fixture(10);
        let clinics = seed(&fx, "clinic", "clinic_id", 2);
        let doctors = seed(&fx, "doctor", "doctor_id", 2).with_dependencies(&["clinic"]);
        let run_id = submit(&fx, vec![clinics, doctors]).await;
        // Every begin fails: the clinic batch exhausts its retries.
        fx.dest.fail_next_begins(100);

        let result = fx
            .executor
            .execute(&run_id, RunControl::new().subscribe())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let doctor = result.entities.iter().find(|e| e.entity_type == "doctor").unwrap();
        assert_eq!(doctor.state, EntityState::Failed);
        assert!(doctor.error.as_deref().unwrap().contains("clinic"));
        assert_eq!(doctor.processed, 0);
        let recovery = result.recovery.unwrap();
        assert!(recovery.resumable);
        assert_eq!(recovery.recommended_action, RecommendedAction::Resume);
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_is_rejected() {
        let fx = fixture(10);
        let clinics = seed(&fx, "clinic", "clinic_id", 1);
        let run_id = submit(&fx, vec![clinics]).await;
        fx.state
            .try_acquire_lease(&run_id, "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let err = fx
            .executor
            .execute(&run_id, RunControl::new().subscribe())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::LeaseHeld { .. }));
        assert!(fx.dest.rows(&table("public", "clinics")).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_marks_run_not_resumable() {
        let fx = fixture(1);
        let clinics = seed(&fx, "clinic", "clinic_id", 4);
        let run_id = submit(&fx, vec![clinics]).await;
        let control = RunControl::new();
        let hook_control = control.clone();
        fx.dest.set_commit_hook(Arc::new(move |commits| {
            if commits == 1 {
                hook_control.cancel(false);
            }
        }));

        let result = fx.executor.execute(&run_id, control.subscribe()).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.records_processed, 1);
        let recovery = result.recovery.unwrap();
        assert_eq!(recovery.recommended_action, RecommendedAction::StartNewRun);
        let cps = fx.executor.checkpoints().list_for_run(&run_id).await.unwrap();
        assert!(cps.iter().all(|c| !c.resumable));
    }

    #[tokio::test]
    async fn test_zero_timeout_leaves_run_paused() {
        let mut fx = fixture(1);
        fx.executor.options.run_timeout = Some(Duration::ZERO);
        let clinics = seed(&fx, "clinic", "clinic_id", 2);
        let run_id = submit(&fx, vec![clinics]).await;

        let result = fx
            .executor
            .execute(&run_id, RunControl::new().subscribe())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Paused);
        assert_eq!(result.records_processed, 0);
        assert_eq!(
            result.recovery.unwrap().recommended_action,
            RecommendedAction::Resume
        );
    }
}
