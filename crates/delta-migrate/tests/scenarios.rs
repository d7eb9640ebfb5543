//! End-to-end sync scenarios over in-memory stores.

mod common;

use common::*;
use delta_migrate::detect::ChangeType;
use delta_migrate::executor::RecommendedAction;
use delta_migrate::resolve::{FileReviewQueue, ManualReviewQueue};
use delta_migrate::schema::PassThrough;
use delta_migrate::{
    CheckpointManager, CheckpointStatus, EntityDescriptor, ErrorKind, MemoryStateBackend,
    MemoryStore, RecordKey, Row, RunControl, RunStatus, SchemaRegistry, SyncService, TableRef,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_scenario_a_new_modified_deleted_since_baseline() {
    let h = Harness::new("  batch_size: 4\n");
    h.seed_clinics(5);
    let initial = h.sync(None).await;
    assert!(initial.is_success());
    assert_eq!(h.dest.rows(&clinics()).len(), 5);

    // Destination-only audit metadata on a record about to change.
    let mut note = Row::new();
    note.insert("audit_note", json!("verified by ops"));
    assert!(h.dest.update_row(&clinics(), "clinic_id", &json!(2), note));

    let baseline = t(10);
    for id in [2, 4] {
        h.source.update_row(
            &legacy_clinics(),
            "clinic_id",
            &json!(id),
            clinic(id, &format!("Clinic {id} (renamed)"), "Lyon", 20),
        );
    }
    for id in 6..=8 {
        h.source
            .insert_row(&legacy_clinics(), clinic(id, &format!("Clinic {id}"), "Paris", 20));
    }
    h.source.remove_row(&legacy_clinics(), "clinic_id", &json!(5));

    let report = h.detect(&["clinic"], Some(baseline)).await;
    let result = &report.results[0];
    assert_eq!(result.summary.new, 3);
    assert_eq!(result.summary.modified, 2);
    assert_eq!(result.summary.deleted, 1);
    assert_eq!(result.summary.total_changes, 6);
    let ids: Vec<RecordKey> = result.changes_detected.iter().map(|c| c.record_id.clone()).collect();
    assert_eq!(ids, [2, 4, 5, 6, 7, 8].map(RecordKey::from).to_vec());
    assert_eq!(result.next_baseline, Some(t(20)));

    let tasks = h.service.plan_tasks(&report.results).unwrap();
    let run = h.service.execute(tasks).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let outcome = &run.entities[0];
    assert_eq!(
        (outcome.inserted, outcome.updated, outcome.deleted),
        (3, 2, 1)
    );

    assert_eq!(h.dest.rows(&clinics()).len(), 7);
    assert_eq!(h.dest.mappings("clinic").len(), 7);
    let renamed = h.dest.row(&clinics(), "clinic_id", &json!(2)).unwrap();
    assert_eq!(renamed.get("name"), Some(&json!("Clinic 2 (renamed)")));
    assert_eq!(renamed.get("audit_note"), Some(&json!("verified by ops")));
    assert!(h.dest.row(&clinics(), "clinic_id", &json!(5)).is_none());
}

#[tokio::test]
async fn test_scenario_b_constraint_violation_isolated() {
    let members = TableRef::new("legacy", "members");
    let dest_members = TableRef::new("public", "members");
    let registry = SchemaRegistry::new()
        .with_entity(
            EntityDescriptor::new("member", members.clone(), dest_members.clone(), "member_id"),
            Arc::new(PassThrough),
        )
        .unwrap();
    let h = Harness::with_registry("  batch_size: 50\n", registry);
    for i in 1..=50 {
        let email = if i == 30 {
            "taken@example.com".to_string()
        } else {
            format!("member{i}@example.com")
        };
        h.source.insert_row(
            &members,
            Row::from_json(json!({"member_id": i, "email": email})).unwrap(),
        );
    }
    h.dest.insert_row(
        &dest_members,
        Row::from_json(json!({"id": "pre-existing", "email": "taken@example.com"})).unwrap(),
    );
    h.dest.add_unique_constraint(&dest_members, "email");

    let result = h.sync(None).await;

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.records_processed, 50);
    assert_eq!(result.records_failed, 1);
    let member = &result.entities[0];
    assert_eq!(member.inserted, 49);
    assert_eq!(member.failures.len(), 1);
    assert_eq!(member.failures[0].record_id, "30");
    assert_eq!(member.failures[0].kind, ErrorKind::Constraint);
    assert!(member.batch_retries > 0);

    let recovery = result.recovery.expect("partial runs carry a recovery block");
    assert_eq!(recovery.recommended_action, RecommendedAction::RetryFailedRecords);
    assert!(recovery.checkpoint_id.is_some());
    assert_eq!(h.dest.mappings("member").len(), 49);

    // The failed record is still pending for the next detection.
    let report = h.detect(&["member"], None).await;
    assert_eq!(report.results[0].changes_detected.len(), 1);
    assert_eq!(report.results[0].changes_detected[0].record_id, RecordKey::from(30));
}

#[tokio::test]
async fn test_scenario_c_pause_then_resume() {
    let h = Harness::new("  batch_size: 2\n  checkpoint_interval: 1\n");
    h.seed_clinics(10);
    let tasks = h.plan(&["clinic"], None).await;

    let slot: Arc<Mutex<Option<RunControl>>> = Arc::new(Mutex::new(None));
    let hook_slot = slot.clone();
    h.dest.set_commit_hook(Arc::new(move |commits| {
        if commits == 2 {
            if let Some(control) = hook_slot.lock().unwrap().as_ref() {
                control.pause();
            }
        }
    }));

    // The test runtime is single-threaded: the spawned run does not start
    // before the control handle is stored.
    let run_id = h.service.submit_run(tasks).await.unwrap();
    *slot.lock().unwrap() = h.service.control(&run_id);

    let paused = h.service.wait(&run_id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.records_processed, 4);
    let recovery = paused.recovery.unwrap();
    assert!(recovery.resumable);
    assert_eq!(recovery.recommended_action, RecommendedAction::Resume);

    let checkpoints = CheckpointManager::new(h.state.clone())
        .list_for_run(&run_id)
        .await
        .unwrap();
    assert_eq!(checkpoints.len(), 1);
    let checkpoint = &checkpoints[0];
    assert_eq!(checkpoint.status, CheckpointStatus::Paused);
    assert_eq!(checkpoint.records_processed, 4);
    assert_eq!(checkpoint.last_processed_key, Some(RecordKey::from(4)));
    assert_eq!(recovery.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));

    let resumed_id = h.service.resume_from_checkpoint(&checkpoint.id).await.unwrap();
    assert_eq!(resumed_id, run_id);
    let done = h.service.wait(&run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.records_processed, 10);
    assert_eq!(done.entities[0].inserted, 10);
    assert_eq!(done.entities[0].skipped, 0);
    assert_eq!(h.dest.mappings("clinic").len(), 10);
    assert_eq!(h.dest.rows(&clinics()).len(), 10);
    // Five batches in total: nothing was committed twice.
    assert_eq!(h.dest.commit_count(), 5);
}

#[tokio::test]
async fn test_parent_and_child_entities_sync_in_dependency_order() {
    let h = Harness::new("  batch_size: 3\n  max_concurrent_entities: 2\n");
    h.seed_clinics(3);
    h.seed_doctors(7, 3);

    let result = h.sync(None).await;
    assert!(result.is_success());
    assert_eq!(result.records_processed, 10);
    assert_eq!(h.dest.mappings("clinic").len(), 3);
    assert_eq!(h.dest.mappings("doctor").len(), 7);
    assert_eq!(result.checkpoints.len(), 2);
}

#[tokio::test]
async fn test_manual_policy_defers_modifications_for_review() {
    let h = Harness::new("  conflict_policy: manual\n");
    h.seed_clinics(3);
    // New records are inserted under every policy.
    assert!(h.sync(None).await.is_success());

    h.source.update_row(
        &legacy_clinics(),
        "clinic_id",
        &json!(1),
        clinic(1, "Clinic 1 (moved)", "Nice", 30),
    );
    let report = h.detect(&["clinic"], Some(t(10))).await;
    assert_eq!(report.results[0].changes_detected[0].change_type, ChangeType::Modified);

    let tasks = h.service.plan_tasks(&report.results).unwrap();
    let result = h.service.execute(tasks).await.unwrap();
    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.records_deferred, 1);
    assert_eq!(
        result.recovery.unwrap().recommended_action,
        RecommendedAction::ReviewDeferred
    );

    let items = h.review.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].record_id, RecordKey::from(1));
    let row = h.dest.row(&clinics(), "clinic_id", &json!(1)).unwrap();
    assert_eq!(row.get("name"), Some(&json!("Clinic 1")));
}

#[tokio::test]
async fn test_configured_review_queue_and_snapshots_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let queue_file = dir.path().join("review.jsonl");
    let snapshot_dir = dir.path().join("snapshots");
    let config = config(&format!(
        "  conflict_policy: manual\n  snapshot_before_resolve: true\n  snapshot_dir: '{}'\n  review_queue_file: '{}'\n",
        snapshot_dir.display(),
        queue_file.display()
    ));

    let source = MemoryStore::new();
    let dest = MemoryStore::new();
    let service = SyncService::new(
        &config,
        Arc::new(registry()),
        Arc::new(source.clone()),
        Arc::new(dest.clone()),
        Arc::new(MemoryStateBackend::new()),
    );
    for i in 1..=2 {
        source.insert_row(&legacy_clinics(), clinic(i, &format!("Clinic {i}"), "Lyon", 0));
    }
    let report = service.detect_changes(&[], None).await;
    let tasks = service.plan_tasks(&report.results).unwrap();
    assert!(service.execute(tasks).await.unwrap().is_success());

    source.update_row(
        &legacy_clinics(),
        "clinic_id",
        &json!(1),
        clinic(1, "Clinic 1 (moved)", "Nice", 30),
    );
    let report = service.detect_changes(&["clinic".to_string()], Some(t(10))).await;
    let tasks = service.plan_tasks(&report.results).unwrap();
    let result = service.execute(tasks).await.unwrap();
    assert_eq!(result.records_deferred, 1);
    assert_eq!(service.review_queue().pending().await.unwrap().len(), 1);
    drop(service);

    // A fresh process sees the deferred record.
    let items = FileReviewQueue::new(&queue_file).pending().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].record_id, RecordKey::from(1));
    assert_eq!(items[0].change_type, ChangeType::Modified);

    // Only the second batch touched an existing destination row.
    let snapshots: Vec<_> = std::fs::read_dir(&snapshot_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(snapshots.len(), 1);
    let content = std::fs::read_to_string(&snapshots[0]).unwrap();
    assert!(content.contains("\"Clinic 1\""));
}
