//! Shared fixtures for the integration tests: a clinic/doctor domain backed
//! by in-memory stores.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use delta_migrate::detect::MigrationTask;
use delta_migrate::resolve::MemoryReviewQueue;
use delta_migrate::schema::PassThrough;
use delta_migrate::{
    Config, DetectionReport, EntityDescriptor, EntityTransformer, ExecutionResult, MemoryStateBackend,
    MemoryStore, Row, SchemaRegistry, SyncService, TableRef,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn legacy_clinics() -> TableRef {
    TableRef::new("legacy", "clinics")
}

pub fn clinics() -> TableRef {
    TableRef::new("public", "clinics")
}

pub fn legacy_doctors() -> TableRef {
    TableRef::new("legacy", "doctors")
}

pub fn doctors() -> TableRef {
    TableRef::new("public", "doctors")
}

/// Fixed origin so timestamps are reproducible.
pub fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn clinic(id: i64, name: &str, city: &str, minute: i64) -> Row {
    Row::from_json(json!({
        "clinic_id": id,
        "name": name,
        "city": city,
        "updated_at": t(minute).to_rfc3339(),
    }))
    .unwrap()
}

pub fn doctor(id: i64, clinic_id: i64, email: &str, minute: i64) -> Row {
    Row::from_json(json!({
        "doctor_id": id,
        "clinic_id": clinic_id,
        "email": email,
        "updated_at": t(minute).to_rfc3339(),
    }))
    .unwrap()
}

pub fn clinic_descriptor() -> EntityDescriptor {
    let mut descriptor =
        EntityDescriptor::new("clinic", legacy_clinics(), clinics(), "clinic_id")
            .with_timestamp_field("updated_at")
            .with_preserved_destination_fields(&["audit_note"])
            .with_priority(10);
    descriptor.hash_fields = vec!["name".into(), "city".into()];
    descriptor
}

pub fn doctor_descriptor() -> EntityDescriptor {
    EntityDescriptor::new("doctor", legacy_doctors(), doctors(), "doctor_id")
        .with_timestamp_field("updated_at")
        .with_dependencies(&["clinic"])
}

pub fn registry() -> SchemaRegistry {
    registry_with(Arc::new(PassThrough), Arc::new(PassThrough))
}

pub fn registry_with(
    clinic_transformer: Arc<dyn EntityTransformer>,
    doctor_transformer: Arc<dyn EntityTransformer>,
) -> SchemaRegistry {
    SchemaRegistry::new()
        .with_entity(clinic_descriptor(), clinic_transformer)
        .unwrap()
        .with_entity(doctor_descriptor(), doctor_transformer)
        .unwrap()
}

pub fn config(sync: &str) -> Config {
    let yaml = format!(
        "source: {{ host: legacy-db, database: legacy, user: sync }}\n\
         target: {{ host: platform-db, database: platform, user: sync }}\n\
         sync:\n  retry_base_delay_ms: 1\n  retry_max_delay_ms: 4\n{}",
        sync
    );
    Config::from_yaml(&yaml).unwrap()
}

pub struct Harness {
    pub source: MemoryStore,
    pub dest: MemoryStore,
    pub state: Arc<MemoryStateBackend>,
    pub review: Arc<MemoryReviewQueue>,
    pub service: SyncService,
}

impl Harness {
    pub fn new(sync: &str) -> Self {
        Self::with_registry(sync, registry())
    }

    pub fn with_registry(sync: &str, registry: SchemaRegistry) -> Self {
        let source = MemoryStore::new();
        let dest = MemoryStore::new();
        let state = Arc::new(MemoryStateBackend::new());
        let review = Arc::new(MemoryReviewQueue::new());
        let service = SyncService::new(
            &config(sync),
            Arc::new(registry),
            Arc::new(source.clone()),
            Arc::new(dest.clone()),
            state.clone(),
        )
        .with_review_queue(review.clone());
        Self {
            source,
            dest,
            state,
            review,
            service,
        }
    }

    pub fn seed_clinics(&self, n: i64) {
        for i in 1..=n {
            self.source
                .insert_row(&legacy_clinics(), clinic(i, &format!("Clinic {i}"), "Lyon", 0));
        }
    }

    pub fn seed_doctors(&self, n: i64, clinics: i64) {
        for i in 1..=n {
            self.source.insert_row(
                &legacy_doctors(),
                doctor(i, (i - 1) % clinics + 1, &format!("dr{i}@example.com"), 0),
            );
        }
    }

    pub async fn detect(&self, entities: &[&str], since: Option<DateTime<Utc>>) -> DetectionReport {
        let names: Vec<String> = entities.iter().map(|e| e.to_string()).collect();
        let report = self.service.detect_changes(&names, since).await;
        assert!(report.errors.is_empty(), "detection failed: {:?}", report.errors);
        report
    }

    pub async fn plan(&self, entities: &[&str], since: Option<DateTime<Utc>>) -> Vec<MigrationTask> {
        let report = self.detect(entities, since).await;
        self.service.plan_tasks(&report.results).unwrap()
    }

    /// Detect everything and execute it inline.
    pub async fn sync(&self, since: Option<DateTime<Utc>>) -> ExecutionResult {
        let tasks = self.plan(&[], since).await;
        self.service.execute(tasks).await.unwrap()
    }

    /// Destination rows without the generated id, ordered by legacy id.
    pub fn dest_rows_without_ids(&self, table: &TableRef, legacy_field: &str) -> Vec<Value> {
        let mut rows: Vec<Value> = self
            .dest
            .rows(table)
            .into_iter()
            .map(|mut row| {
                row.remove("id");
                serde_json::to_value(&row).unwrap()
            })
            .collect();
        rows.sort_by_key(|r| r[legacy_field].as_i64());
        rows
    }
}
