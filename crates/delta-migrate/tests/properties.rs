//! Properties the engine must hold regardless of input.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::*;
use delta_migrate::checkpoint::CheckpointProgress;
use delta_migrate::session::{EntityState, Lease};
use delta_migrate::{
    Checkpoint, CheckpointManager, CheckpointStatus, EntityTransformer, MemoryStateBackend,
    MemoryStore, MigrateError, RecordKey, Result, Row, RunControl, RunRecord, RunStatus,
    StateBackend, SyncService,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pause the run when the destination reaches `at` commits.
fn pause_at(dest: &MemoryStore, at: usize) -> Arc<Mutex<Option<RunControl>>> {
    let slot: Arc<Mutex<Option<RunControl>>> = Arc::new(Mutex::new(None));
    let hook_slot = slot.clone();
    dest.set_commit_hook(Arc::new(move |commits| {
        if commits == at {
            if let Some(control) = hook_slot.lock().unwrap().as_ref() {
                control.pause();
            }
        }
    }));
    slot
}

#[tokio::test]
async fn test_detection_is_idempotent() {
    let h = Harness::new("  batch_size: 3\n");
    h.seed_clinics(5);
    h.seed_doctors(6, 5);
    assert!(h.sync(None).await.is_success());

    for since in [None, Some(t(0))] {
        let report = h.detect(&[], since).await;
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.total_changes(), 0, "since {:?}", since);
    }
}

#[tokio::test]
async fn test_applying_same_changes_twice_converges() {
    let h = Harness::new("  batch_size: 2\n");
    h.seed_clinics(5);
    let tasks = h.plan(&["clinic"], None).await;

    let first = h.service.execute(tasks.clone()).await.unwrap();
    assert!(first.is_success());
    let rows_once = h.dest.rows(&clinics());
    let mappings_once = h.dest.mappings("clinic");

    let second = h.service.execute(tasks).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.entities[0].skipped, 5);
    assert_eq!(second.entities[0].inserted, 0);

    assert_eq!(h.dest.rows(&clinics()), rows_once);
    let mappings_twice = h.dest.mappings("clinic");
    assert_eq!(mappings_twice.len(), mappings_once.len());
    for (a, b) in mappings_once.iter().zip(&mappings_twice) {
        assert_eq!(a.new_id, b.new_id);
        assert_eq!(a.checksum, b.checksum);
    }
}

/// Memory backend that records every persisted checkpoint state.
struct RecordingState {
    inner: MemoryStateBackend,
    writes: Mutex<HashMap<String, Vec<u64>>>,
    /// Checkpoint writes for this entity fail: every insert, and updates
    /// carrying the given status.
    broken: Mutex<Option<(String, Option<CheckpointStatus>)>>,
}

impl RecordingState {
    fn new() -> Self {
        Self {
            inner: MemoryStateBackend::new(),
            writes: Mutex::new(HashMap::new()),
            broken: Mutex::new(None),
        }
    }

    fn break_inserts(&self, entity: &str) {
        *self.broken.lock().unwrap() = Some((entity.to_string(), None));
    }

    fn break_updates(&self, entity: &str, status: CheckpointStatus) {
        *self.broken.lock().unwrap() = Some((entity.to_string(), Some(status)));
    }

    fn check(&self, checkpoint: &Checkpoint, insert: bool) -> Result<()> {
        let broken = self.broken.lock().unwrap().clone();
        let hit = match broken {
            Some((entity, _)) if entity != checkpoint.entity_type => false,
            Some((_, None)) => insert,
            Some((_, Some(status))) => !insert && checkpoint.status == status,
            None => false,
        };
        if hit {
            return Err(MigrateError::State("checkpoint table unavailable".into()));
        }
        Ok(())
    }

    fn record(&self, checkpoint: &Checkpoint) {
        self.writes
            .lock()
            .unwrap()
            .entry(checkpoint.id.clone())
            .or_default()
            .push(checkpoint.records_processed);
    }
}

#[async_trait]
impl StateBackend for RecordingState {
    async fn init_schema(&self) -> Result<()> {
        self.inner.init_schema().await
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.inner.save_run(run).await
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.inner.load_run(run_id).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.inner.list_runs(limit).await
    }

    async fn find_run_by_checkpoint(&self, checkpoint_id: &str) -> Result<Option<RunRecord>> {
        self.inner.find_run_by_checkpoint(checkpoint_id).await
    }

    async fn try_acquire_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        self.inner.try_acquire_lease(run_id, owner, ttl).await
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<()> {
        self.inner.release_lease(run_id, owner).await
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check(checkpoint, true)?;
        self.inner.insert_checkpoint(checkpoint).await?;
        self.record(checkpoint);
        Ok(())
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check(checkpoint, false)?;
        self.inner.update_checkpoint(checkpoint).await?;
        self.record(checkpoint);
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.inner.get_checkpoint(id).await
    }

    async fn latest_checkpoint(
        &self,
        entity_type: &str,
        run_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        self.inner.latest_checkpoint(entity_type, run_id).await
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints(run_id).await
    }

    async fn delete_checkpoints_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_checkpoints_before(cutoff).await
    }

    fn backend_type(&self) -> &'static str {
        "recording"
    }
}

#[tokio::test]
async fn test_checkpoint_progress_never_decreases() {
    let source = MemoryStore::new();
    let dest = MemoryStore::new();
    let state = Arc::new(RecordingState::new());
    let service = SyncService::new(
        &config("  batch_size: 2\n  checkpoint_interval: 1\n"),
        Arc::new(registry()),
        Arc::new(source.clone()),
        Arc::new(dest.clone()),
        state.clone(),
    );
    for i in 1..=9 {
        source.insert_row(&legacy_clinics(), clinic(i, &format!("Clinic {i}"), "Lyon", 0));
    }
    for i in 1..=4 {
        source.insert_row(&legacy_doctors(), doctor(i, 1, &format!("dr{i}@example.com"), 0));
    }
    let names: Vec<String> = Vec::new();
    let report = service.detect_changes(&names, None).await;
    let tasks = service.plan_tasks(&report.results).unwrap();

    let slot = pause_at(&dest, 3);
    let run_id = service.submit_run(tasks).await.unwrap();
    *slot.lock().unwrap() = service.control(&run_id);
    assert_eq!(service.wait(&run_id).await.unwrap().status, RunStatus::Paused);
    service.resume(&run_id).await.unwrap();
    assert!(service.wait(&run_id).await.unwrap().is_success());

    let writes = state.writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 2);
    for (id, sequence) in &writes {
        assert!(
            sequence.windows(2).all(|w| w[0] <= w[1]),
            "checkpoint {} regressed: {:?}",
            id,
            sequence
        );
    }
    assert_eq!(writes.values().map(|s| *s.last().unwrap()).sum::<u64>(), 13);

    // A regressing write is rejected outright.
    let manager = CheckpointManager::new(state.clone());
    let checkpoint = manager.list_for_run(&run_id).await.unwrap().remove(0);
    let err = manager
        .update(
            &checkpoint.id,
            CheckpointProgress {
                status: CheckpointStatus::Running,
                last_processed_key: Some(RecordKey::from(1)),
                records_processed: 1,
                batches_committed: 1,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::Checkpoint(_)));
}

/// Service over a recording state with three clinics and two doctors.
async fn checkpoint_fixture() -> (SyncService, Arc<RecordingState>, MemoryStore, Vec<delta_migrate::MigrationTask>) {
    let source = MemoryStore::new();
    let dest = MemoryStore::new();
    let state = Arc::new(RecordingState::new());
    let service = SyncService::new(
        &config("  batch_size: 2\n  checkpoint_interval: 1\n"),
        Arc::new(registry()),
        Arc::new(source.clone()),
        Arc::new(dest.clone()),
        state.clone(),
    );
    for i in 1..=3 {
        source.insert_row(&legacy_clinics(), clinic(i, &format!("Clinic {i}"), "Lyon", 0));
    }
    for i in 1..=2 {
        source.insert_row(&legacy_doctors(), doctor(i, 1, &format!("dr{i}@example.com"), 0));
    }
    let names: Vec<String> = Vec::new();
    let report = service.detect_changes(&names, None).await;
    let tasks = service.plan_tasks(&report.results).unwrap();
    (service, state, dest, tasks)
}

#[tokio::test]
async fn test_checkpoint_failure_at_entity_completion_is_fatal() {
    let (service, state, dest, tasks) = checkpoint_fixture().await;
    state.break_updates("clinic", CheckpointStatus::Completed);

    let result = service.execute(tasks).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);

    let run = state.load_run(&result.run_id).await.unwrap().unwrap();
    assert!(run.fatal_error.is_some());
    assert_eq!(run.entities["clinic"].state, EntityState::Failed);
    // The dependent entity was aborted before it began.
    assert_eq!(run.entities["doctor"].state, EntityState::Pending);
    assert!(run.entities["doctor"].checkpoint_id.is_none());
    assert!(dest.rows(&doctors()).is_empty());
}

#[tokio::test]
async fn test_checkpoint_failure_at_entity_start_is_fatal() {
    let (service, state, dest, tasks) = checkpoint_fixture().await;
    state.break_inserts("doctor");

    let result = service.execute(tasks).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);

    let run = state.load_run(&result.run_id).await.unwrap().unwrap();
    let fatal = run.fatal_error.clone().unwrap();
    assert!(fatal.contains("checkpoint table unavailable"), "{}", fatal);
    assert_eq!(run.entities["clinic"].state, EntityState::Completed);
    assert_eq!(run.entities["doctor"].state, EntityState::Failed);
    assert_eq!(dest.rows(&clinics()).len(), 3);
    assert!(dest.rows(&doctors()).is_empty());
}

#[tokio::test]
async fn test_children_never_start_before_parents_finish() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let clinic_log = log.clone();
    let doctor_log = log.clone();
    let clinic_transformer: Arc<dyn EntityTransformer> = Arc::new(move |row: &Row| -> Result<Row> {
        clinic_log.lock().unwrap().push("clinic");
        Ok(row.clone())
    });
    let doctor_transformer: Arc<dyn EntityTransformer> = Arc::new(move |row: &Row| -> Result<Row> {
        doctor_log.lock().unwrap().push("doctor");
        Ok(row.clone())
    });
    let h = Harness::with_registry(
        "  batch_size: 2\n  max_concurrent_entities: 4\n",
        registry_with(clinic_transformer, doctor_transformer),
    );
    h.seed_clinics(6);
    h.seed_doctors(8, 6);

    assert!(h.sync(None).await.is_success());

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 14);
    let last_clinic = log.iter().rposition(|e| *e == "clinic").unwrap();
    let first_doctor = log.iter().position(|e| *e == "doctor").unwrap();
    assert!(last_clinic < first_doctor, "order: {:?}", *log);
}

#[tokio::test]
async fn test_pause_resume_matches_uninterrupted_run() {
    let sync = "  batch_size: 3\n  checkpoint_interval: 2\n";
    let straight = Harness::new(sync);
    let interrupted = Harness::new(sync);
    for h in [&straight, &interrupted] {
        h.seed_clinics(7);
        h.seed_doctors(11, 7);
    }

    assert!(straight.sync(None).await.is_success());

    let tasks = interrupted.plan(&[], None).await;
    let slot = pause_at(&interrupted.dest, 4);
    let run_id = interrupted.service.submit_run(tasks).await.unwrap();
    *slot.lock().unwrap() = interrupted.service.control(&run_id);
    let paused = interrupted.service.wait(&run_id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.records_processed < 18);

    interrupted.service.resume(&run_id).await.unwrap();
    let done = interrupted.service.wait(&run_id).await.unwrap();
    assert!(done.is_success());
    assert_eq!(done.records_processed, 18);

    for (table, legacy) in [(clinics(), "clinic_id"), (doctors(), "doctor_id")] {
        assert_eq!(
            straight.dest_rows_without_ids(&table, legacy),
            interrupted.dest_rows_without_ids(&table, legacy)
        );
    }
    assert_eq!(interrupted.dest.mappings("clinic").len(), 7);
    assert_eq!(interrupted.dest.mappings("doctor").len(), 11);
}

#[tokio::test]
async fn test_source_wins_destination_matches_source_hash() {
    let h = Harness::new("  batch_size: 2\n");
    h.seed_clinics(4);
    assert!(h.sync(None).await.is_success());

    let mut note = Row::new();
    note.insert("audit_note", json!("keep me"));
    h.dest.update_row(&clinics(), "clinic_id", &json!(3), note);
    for (id, city) in [(1, "Nice"), (3, "Lille")] {
        h.source.update_row(
            &legacy_clinics(),
            "clinic_id",
            &json!(id),
            clinic(id, &format!("Clinic {id}"), city, 15),
        );
    }

    let report = h.detect(&["clinic"], Some(t(10))).await;
    let changes = report.results[0].changes_detected.clone();
    assert_eq!(changes.len(), 2);
    let tasks = h.service.plan_tasks(&report.results).unwrap();
    assert!(h.service.execute(tasks).await.unwrap().is_success());

    let descriptor = clinic_descriptor();
    let mappings = h.dest.mappings("clinic");
    for change in &changes {
        let row = h
            .dest
            .row(&clinics(), "clinic_id", &change.record_id.to_value())
            .unwrap();
        assert_eq!(Some(descriptor.content_hash(&row)), change.content_hash);
        let mapping = mappings
            .iter()
            .find(|m| m.legacy_id == change.record_id)
            .unwrap();
        assert_eq!(Some(mapping.checksum.clone()), change.content_hash);
    }
    let kept = h.dest.row(&clinics(), "clinic_id", &json!(3)).unwrap();
    assert_eq!(kept.get("audit_note"), Some(&json!("keep me")));
    assert_eq!(kept.get("city"), Some(&json!("Lille")));
}
