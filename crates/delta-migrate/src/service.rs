//! Caller-facing API: detection, run submission, status and run control.
//!
//! Runs are addressed by run id or by the id of any of their checkpoints.
//! Control requests for a run executing in this process go through its
//! [`RunControl`]; they are also persisted on the run record so an
//! executor in another process picks them up at its next batch boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::{Config, SyncConfig};
use crate::detect::{self, DetectOptions, DetectionResult, DifferentialDetector, MigrationTask};
use crate::error::{MigrateError, Result};
use crate::executor::{
    dependency_waves, ExecutionResult, ExecutorOptions, MigrationExecutor, RunControl, WaveNode,
};
use crate::progress::{ProgressSettings, ProgressSnapshot, ProgressTracker};
use crate::resolve::{
    ConflictResolver, FileReviewQueue, FileSnapshotSink, ManualReviewQueue, MemoryReviewQueue,
    PgReviewQueue, SnapshotSink,
};
use crate::schema::{SchemaProvider, SchemaRegistry};
use crate::session::{Lease, MigrationStatus, RunRecord, RunStatus};
use crate::state::{FileStateBackend, PgStateBackend, StateBackend};
use crate::store::{DestinationStore, PgStore, SourceStore};

/// Detection output for several entity types. A failing entity does not
/// hide the results of the others.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionReport {
    pub results: Vec<DetectionResult>,
    /// Entity type to error message.
    pub errors: BTreeMap<String, String>,
}

impl DetectionReport {
    pub fn total_changes(&self) -> u64 {
        self.results.iter().map(|r| r.summary.total_changes).sum()
    }
}

/// Answer to `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: String,
    pub status: RunStatus,
    pub sets: MigrationStatus,
    pub progress: ProgressSnapshot,
    pub lease: Option<Lease>,
    pub executing_locally: bool,
    pub result: ExecutionResult,
}

struct LiveRun {
    control: RunControl,
    handle: Option<JoinHandle<Result<ExecutionResult>>>,
}

impl LiveRun {
    fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

/// The sync engine as seen by callers (CLI, services, tests).
pub struct SyncService {
    config_hash: String,
    sync: SyncConfig,
    schema: Arc<dyn SchemaProvider>,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    state: Arc<dyn StateBackend>,
    review_queue: Arc<dyn ManualReviewQueue>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
    options: ExecutorOptions,
    progress: ProgressTracker,
    live: Arc<Mutex<HashMap<String, LiveRun>>>,
}

impl SyncService {
    /// Assemble a service from already built parts.
    pub fn new(
        config: &Config,
        schema: Arc<dyn SchemaProvider>,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        state: Arc<dyn StateBackend>,
    ) -> Self {
        let review_queue: Arc<dyn ManualReviewQueue> = match &config.sync.review_queue_file {
            Some(path) => Arc::new(FileReviewQueue::new(path)),
            None => Arc::new(MemoryReviewQueue::new()),
        };
        let snapshots: Option<Arc<dyn SnapshotSink>> =
            match (config.sync.snapshot_before_resolve, &config.sync.snapshot_dir) {
                (true, Some(dir)) => {
                    info!(dir = %dir, "Pre-resolution snapshots enabled");
                    Some(Arc::new(FileSnapshotSink::new(dir)))
                }
                _ => None,
            };
        Self {
            config_hash: config.hash(),
            sync: config.sync.clone(),
            schema,
            source,
            destination,
            state,
            review_queue,
            snapshots,
            options: ExecutorOptions::from_config(&config.sync),
            progress: ProgressTracker::new(ProgressSettings::from_config(&config.progress)),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect to the configured PostgreSQL databases.
    ///
    /// Run state lives in the target database unless `state_file` is given,
    /// in which case it is kept in an HMAC-signed JSON file.
    pub async fn connect(config: &Config, state_file: Option<&Path>) -> Result<Self> {
        let state_schema = config.sync.get_state_schema();
        let source = PgStore::connect(&config.source, config.pool_size(&config.source), state_schema).await?;
        let target = PgStore::connect(&config.target, config.pool_size(&config.target), state_schema).await?;
        target.init_mappings().await?;

        let state: Arc<dyn StateBackend> = match state_file {
            Some(path) => Arc::new(FileStateBackend::open(path, &config.hash())?),
            None => Arc::new(PgStateBackend::new(target.pool().clone(), state_schema)),
        };
        state.init_schema().await?;
        info!(backend = state.backend_type(), "State backend ready");

        let review_queue: Option<Arc<dyn ManualReviewQueue>> =
            match (&config.sync.review_queue_file, state_file) {
                (Some(_), _) => None,
                (None, Some(path)) => Some(Arc::new(FileReviewQueue::new(review_queue_path(path)))),
                (None, None) => {
                    let queue = PgReviewQueue::new(target.pool().clone(), state_schema);
                    queue.init_schema().await?;
                    Some(Arc::new(queue))
                }
            };

        let schema = Arc::new(SchemaRegistry::from_config(&config.entities)?);
        let service = Self::new(config, schema, Arc::new(source), Arc::new(target), state);
        Ok(match review_queue {
            Some(queue) => service.with_review_queue(queue),
            None => service,
        })
    }

    pub fn with_review_queue(mut self, queue: Arc<dyn ManualReviewQueue>) -> Self {
        self.review_queue = queue;
        self
    }

    /// Snapshot through `sink` whatever `snapshot_before_resolve` says.
    pub fn with_snapshots(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    pub fn with_executor_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn review_queue(&self) -> &Arc<dyn ManualReviewQueue> {
        &self.review_queue
    }

    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveRun>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn executor(&self) -> MigrationExecutor {
        let mut resolver = ConflictResolver::new(
            self.sync.conflict_policy,
            self.schema.clone(),
            self.source.clone(),
            self.destination.clone(),
        )
        .with_review_queue(self.review_queue.clone());
        if let Some(sink) = &self.snapshots {
            resolver = resolver.with_snapshots(sink.clone());
        }
        MigrationExecutor::new(self.options.clone(), Arc::new(resolver), self.state.clone())
            .with_progress(self.progress.clone())
    }

    fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(self.state.clone())
    }

    /// Verify both stores respond.
    pub async fn health_check(&self) -> Result<()> {
        self.source.ping().await?;
        self.destination.ping().await?;
        Ok(())
    }

    /// Run detection for `entity_types` (every registered type when empty).
    pub async fn detect_changes(
        &self,
        entity_types: &[String],
        since: Option<DateTime<Utc>>,
    ) -> DetectionReport {
        let detector = DifferentialDetector::new(
            self.source.clone(),
            self.destination.clone(),
            self.schema.clone(),
        );
        let options = DetectOptions {
            since,
            include_deletes: self.sync.get_include_deletes(),
            batch_size: self.sync.get_batch_size(),
        };
        let entities = if entity_types.is_empty() {
            self.schema.entity_types()
        } else {
            entity_types.to_vec()
        };

        let mut report = DetectionReport::default();
        for entity in entities {
            match detector.detect(&entity, &options).await {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    error!(entity = %entity, "Detection failed: {}", e);
                    report.errors.insert(entity, e.to_string());
                }
            }
        }
        report
    }

    pub fn plan_tasks(&self, results: &[DetectionResult]) -> Result<Vec<MigrationTask>> {
        detect::plan_tasks(results, self.schema.as_ref())
    }

    /// Validate and persist a new run without executing it.
    pub async fn create_run(&self, tasks: Vec<MigrationTask>) -> Result<String> {
        for task in &tasks {
            self.schema.descriptor(&task.entity_type)?;
        }
        let nodes: Vec<WaveNode> = tasks
            .iter()
            .map(|t| WaveNode {
                name: t.entity_type.clone(),
                dependencies: t.dependencies.clone(),
                priority: t.priority,
            })
            .collect();
        dependency_waves(&nodes)?;

        let run = RunRecord::new(self.config_hash.clone(), tasks);
        self.state.save_run(&run).await?;
        info!(run_id = %run.run_id, entities = run.entities.len(), records = run.total_records(), "Run submitted");
        Ok(run.run_id)
    }

    /// Persist a run and start executing it in the background.
    pub async fn submit_run(&self, tasks: Vec<MigrationTask>) -> Result<String> {
        let run_id = self.create_run(tasks).await?;
        self.spawn(&run_id);
        Ok(run_id)
    }

    /// Persist a run and execute it to the end on the calling task.
    pub async fn execute(&self, tasks: Vec<MigrationTask>) -> Result<ExecutionResult> {
        let run_id = self.create_run(tasks).await?;
        self.execute_run(&run_id).await
    }

    /// Execute an existing run on the calling task.
    pub async fn execute_run(&self, run_id: &str) -> Result<ExecutionResult> {
        let control = RunControl::new();
        self.live().insert(
            run_id.to_string(),
            LiveRun {
                control: control.clone(),
                handle: None,
            },
        );
        let result = self.executor().execute(run_id, control.subscribe()).await;
        self.live().remove(run_id);
        result
    }

    fn spawn(&self, run_id: &str) {
        let control = RunControl::new();
        let executor = self.executor();
        self.progress.register(run_id);
        let rx = control.subscribe();
        let id = run_id.to_string();
        let handle = tokio::spawn(async move {
            let result = executor.execute(&id, rx).await;
            if let Err(e) = &result {
                error!(run_id = %id, "Run execution failed: {}", e);
            }
            result
        });
        self.live().insert(
            run_id.to_string(),
            LiveRun {
                control,
                handle: Some(handle),
            },
        );
    }

    /// Wait for a run started by `submit_run` or `resume` to stop.
    pub async fn wait(&self, run_id: &str) -> Result<ExecutionResult> {
        let handle = self.live().get_mut(run_id).and_then(|r| r.handle.take());
        let Some(handle) = handle else {
            return Err(MigrateError::NotFound(format!(
                "no background execution for run {}",
                run_id
            )));
        };
        let result = handle
            .await
            .map_err(|e| MigrateError::State(format!("execution task failed: {}", e)))?;
        self.live().remove(run_id);
        result
    }

    /// Control handle of a run executing in this process.
    pub fn control(&self, run_id: &str) -> Option<RunControl> {
        self.live().get(run_id).map(|r| r.control.clone())
    }

    fn executing_locally(&self, run_id: &str) -> bool {
        self.live()
            .get(run_id)
            .map_or(false, |r| r.handle.is_none() || r.is_running())
    }

    /// Look a run up by run id, then by checkpoint id.
    async fn find_run(&self, id: &str) -> Result<RunRecord> {
        if let Some(run) = self.state.load_run(id).await? {
            return Ok(run);
        }
        self.state
            .find_run_by_checkpoint(id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("run or checkpoint {}", id)))
    }

    pub async fn get_status(&self, id: &str) -> Result<StatusReport> {
        let run = self.find_run(id).await?;
        let checkpoints = self.checkpoints().list_for_run(&run.run_id).await?;
        let progress = match self.progress.snapshot(&run.run_id) {
            Some(live) if !live.status.is_terminal() => live,
            _ => self.progress.snapshot_from_run(&run),
        };
        Ok(StatusReport {
            run_id: run.run_id.clone(),
            status: run.status(),
            sets: run.sets(),
            progress,
            lease: run.lease.clone().filter(|l| l.is_live(Utc::now())),
            executing_locally: self.executing_locally(&run.run_id),
            result: ExecutionResult::from_run(&run, &checkpoints),
        })
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.state.list_runs(limit).await
    }

    /// Ask a run to stop at its next batch boundary.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut run = self.find_run(id).await?;
        if run.status().is_terminal() {
            return Err(MigrateError::State(format!(
                "run {} is {} and cannot be paused",
                run.run_id,
                run.status().as_str()
            )));
        }
        if let Some(control) = self.control(&run.run_id) {
            control.pause();
        }
        run.pause_requested = true;
        run.touch();
        self.state.save_run(&run).await?;
        info!(run_id = %run.run_id, "Pause requested");
        Ok(())
    }

    /// Cancel a run. Unless `force` is set the run can't be resumed and its
    /// checkpoints are retired.
    pub async fn cancel(&self, id: &str, force: bool) -> Result<()> {
        let mut run = self.find_run(id).await?;
        if run.status() == RunStatus::Completed {
            return Err(MigrateError::State(format!(
                "run {} already completed",
                run.run_id
            )));
        }
        let run_id = run.run_id.clone();
        run.cancel_requested = true;
        run.resumable = force;

        let lease_live = run.lease.as_ref().map_or(false, |l| l.is_live(Utc::now()));
        if self.executing_locally(&run_id) || lease_live {
            if let Some(control) = self.control(&run_id) {
                control.cancel(force);
            }
            run.touch();
            self.state.save_run(&run).await?;
            info!(run_id = %run_id, force, "Cancel requested; the executor stops at the next batch boundary");
            return Ok(());
        }

        // Nobody is executing it: finish the cancel here.
        run.cancelled = true;
        if run.status().is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        run.touch();
        self.state.save_run(&run).await?;
        if !force {
            self.checkpoints().retire_run(&run_id).await?;
        }
        warn!(run_id = %run_id, force, "Run cancelled");
        Ok(())
    }

    /// Continue a paused, failed, partial or force-cancelled run in the
    /// background. Failed entities are retried from their checkpoints.
    pub async fn resume(&self, id: &str) -> Result<String> {
        let mut run = self.find_run(id).await?;
        let run_id = run.run_id.clone();
        if self.executing_locally(&run_id) {
            return Err(MigrateError::State(format!("run {} is still executing", run_id)));
        }
        // A running run without a live lease was left behind by a crashed
        // executor and may be picked up.
        if let Some(lease) = run.lease.as_ref().filter(|l| l.is_live(Utc::now())) {
            return Err(MigrateError::State(format!(
                "run {} is executing on {} (lease expires {})",
                run_id, lease.owner, lease.expires_at
            )));
        }
        if !run.can_resume() {
            return Err(MigrateError::State(format!(
                "run {} is {} and cannot be resumed",
                run_id,
                run.status().as_str()
            )));
        }
        if run.config_hash != self.config_hash {
            warn!(run_id = %run_id, "Configuration changed since the run was submitted");
        }

        run.pause_requested = false;
        run.cancel_requested = false;
        run.cancelled = false;
        run.requeue_failed();
        run.touch();
        self.state.save_run(&run).await?;
        info!(run_id = %run_id, "Resuming run");

        self.spawn(&run_id);
        Ok(run_id)
    }

    /// Resume the run that owns `checkpoint_id`.
    pub async fn resume_from_checkpoint(&self, checkpoint_id: &str) -> Result<String> {
        let run = self
            .state
            .find_run_by_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("checkpoint {}", checkpoint_id)))?;
        self.resume(&run.run_id).await
    }

    /// Live progress updates for a run.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<ProgressSnapshot> {
        self.progress.subscribe(run_id)
    }

    /// Remove non-resumable checkpoints past the retention window.
    pub async fn cleanup_checkpoints(&self) -> Result<u64> {
        self.checkpoints()
            .cleanup(self.sync.get_checkpoint_retention_days())
            .await
    }
}

/// Review queue file kept beside a state file: `state.json` gives
/// `state.review.jsonl`.
pub fn review_queue_path(state_file: &Path) -> PathBuf {
    state_file.with_extension("review.jsonl")
}
