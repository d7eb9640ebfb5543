//! In-process store used by tests and dry runs.
//!
//! Implements both [`SourceStore`] and [`DestinationStore`]. Transactions are
//! copy-on-touch: the first write to a table (or an entity's mapping
//! partition) clones it into the transaction, and commit swaps the copies in.
//! Concurrent transactions on disjoint tables therefore never interfere.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{DestinationStore, DestinationTx, SourceStore, UpsertOutcome};
use crate::core::query::compare_values;
use crate::core::{RecordKey, Row, SelectQuery, TableRef};
use crate::error::{MigrateError, Result};
use crate::mapping::{MappingStore, MigrationMapping};

/// Called after each successful commit with the running commit count.
pub type CommitHook = Arc<dyn Fn(usize) + Send + Sync>;

type Partition = BTreeMap<RecordKey, MigrationMapping>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<TableRef, Vec<Row>>,
    unique: HashMap<TableRef, Vec<String>>,
    mappings: HashMap<String, Partition>,
    select_failures: usize,
    begin_failures: usize,
    commit_failures: usize,
    commits: usize,
}

/// Shared in-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    commit_hook: Arc<Mutex<Option<CommitHook>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryStore")
            .field("tables", &state.tables.len())
            .field("commits", &state.commits)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_matches(row: &Row, key_field: &str, key: &Value) -> bool {
    row.get(key_field)
        .map_or(false, |v| compare_values(v, key) == Some(Ordering::Equal))
}

/// Order by one field, nulls last.
fn order_rows(a: &Row, b: &Row, field: &str) -> Ordering {
    let present = |r: &Row| r.get(field).filter(|v| !v.is_null()).cloned();
    match (present(a), present(b)) {
        (Some(x), Some(y)) => compare_values(&x, &y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn run_query(rows: &[Row], query: &SelectQuery) -> Vec<Row> {
    let mut out: Vec<Row> = rows.iter().filter(|r| query.matches(r)).cloned().collect();
    if let Some(field) = &query.order_by {
        out.sort_by(|a, b| order_rows(a, b, field));
    }
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    out.iter().map(|r| query.project(r)).collect()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Seed a row without constraint checks.
    pub fn insert_row(&self, table: &TableRef, row: Row) {
        self.lock().tables.entry(table.clone()).or_default().push(row);
    }

    pub fn insert_rows(&self, table: &TableRef, rows: impl IntoIterator<Item = Row>) {
        self.lock()
            .tables
            .entry(table.clone())
            .or_default()
            .extend(rows);
    }

    /// Overwrite fields of the row whose `key_field` equals `key`.
    pub fn update_row(&self, table: &TableRef, key_field: &str, key: &Value, patch: Row) -> bool {
        let mut state = self.lock();
        let Some(rows) = state.tables.get_mut(table) else {
            return false;
        };
        match rows.iter_mut().find(|r| key_matches(r, key_field, key)) {
            Some(row) => {
                for (name, value) in patch.fields() {
                    row.insert(name.clone(), value.clone());
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_row(&self, table: &TableRef, key_field: &str, key: &Value) -> bool {
        let mut state = self.lock();
        let Some(rows) = state.tables.get_mut(table) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|r| !key_matches(r, key_field, key));
        rows.len() != before
    }

    /// Committed rows of a table, in insertion order.
    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &TableRef, key_field: &str, key: &Value) -> Option<Row> {
        self.lock()
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| key_matches(r, key_field, key)).cloned())
    }

    /// Committed mappings of an entity type, in key order.
    pub fn mappings(&self, entity_type: &str) -> Vec<MigrationMapping> {
        self.lock()
            .mappings
            .get(entity_type)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Reject writes that would duplicate a non-null value of `field`.
    pub fn add_unique_constraint(&self, table: &TableRef, field: impl Into<String>) {
        self.lock()
            .unique
            .entry(table.clone())
            .or_default()
            .push(field.into());
    }

    /// The next `n` selects fail with a connection error.
    pub fn fail_next_selects(&self, n: usize) {
        self.lock().select_failures = n;
    }

    /// The next `n` transaction begins fail with a connection error.
    pub fn fail_next_begins(&self, n: usize) {
        self.lock().begin_failures = n;
    }

    /// The next `n` commits fail with a connection error (and roll back).
    pub fn fail_next_commits(&self, n: usize) {
        self.lock().commit_failures = n;
    }

    pub fn set_commit_hook(&self, hook: CommitHook) {
        *lock(&self.commit_hook) = Some(hook);
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    fn query(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let mut state = self.lock();
        if state.select_failures > 0 {
            state.select_failures -= 1;
            return Err(MigrateError::Connection(format!(
                "injected failure selecting from {}",
                query.table
            )));
        }
        Ok(state
            .tables
            .get(&query.table)
            .map(|rows| run_query(rows, query))
            .unwrap_or_default())
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        self.query(query)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn get_mapping(
        &self,
        entity_type: &str,
        legacy_id: &RecordKey,
    ) -> Result<Option<MigrationMapping>> {
        Ok(self
            .lock()
            .mappings
            .get(entity_type)
            .and_then(|p| p.get(legacy_id).cloned()))
    }

    async fn get_mappings(
        &self,
        entity_type: &str,
        legacy_ids: &[RecordKey],
    ) -> Result<HashMap<RecordKey, MigrationMapping>> {
        let state = self.lock();
        let Some(partition) = state.mappings.get(entity_type) else {
            return Ok(HashMap::new());
        };
        Ok(legacy_ids
            .iter()
            .filter_map(|id| partition.get(id).map(|m| (id.clone(), m.clone())))
            .collect())
    }

    async fn list_mappings(
        &self,
        entity_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationMapping>> {
        Ok(self
            .lock()
            .mappings
            .get(entity_type)
            .map(|p| p.values().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn count_mappings(&self, entity_type: &str) -> Result<u64> {
        Ok(self
            .lock()
            .mappings
            .get(entity_type)
            .map_or(0, |p| p.len() as u64))
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        self.query(query)
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTx>> {
        let mut state = self.lock();
        if state.begin_failures > 0 {
            state.begin_failures -= 1;
            return Err(MigrateError::Connection(
                "injected failure opening transaction".into(),
            ));
        }
        let unique = state.unique.clone();
        drop(state);
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            unique,
            tables: HashMap::new(),
            mappings: HashMap::new(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}

struct MemoryTx {
    store: MemoryStore,
    unique: HashMap<TableRef, Vec<String>>,
    tables: HashMap<TableRef, Vec<Row>>,
    mappings: HashMap<String, Partition>,
}

impl MemoryTx {
    fn table_mut(&mut self, table: &TableRef) -> &mut Vec<Row> {
        if !self.tables.contains_key(table) {
            let copy = self.store.lock().tables.get(table).cloned().unwrap_or_default();
            self.tables.insert(table.clone(), copy);
        }
        self.tables.entry(table.clone()).or_default()
    }

    fn partition_mut(&mut self, entity_type: &str) -> &mut Partition {
        if !self.mappings.contains_key(entity_type) {
            let copy = self
                .store
                .lock()
                .mappings
                .get(entity_type)
                .cloned()
                .unwrap_or_default();
            self.mappings.insert(entity_type.to_string(), copy);
        }
        self.mappings.entry(entity_type.to_string()).or_default()
    }

    fn check_unique(
        &self,
        table: &TableRef,
        rows: &[Row],
        key_field: &str,
        candidate: &Row,
    ) -> Result<()> {
        let Some(fields) = self.unique.get(table) else {
            return Ok(());
        };
        let key = candidate.get(key_field).cloned().unwrap_or(Value::Null);
        for field in fields {
            let Some(value) = candidate.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = rows.iter().any(|r| {
                !key_matches(r, key_field, &key)
                    && r.get(field)
                        .map_or(false, |v| compare_values(v, value) == Some(Ordering::Equal))
            });
            if clash {
                return Err(MigrateError::constraint(
                    table.to_string(),
                    format!("duplicate key value violates unique constraint on {}", field),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationTx for MemoryTx {
    async fn get_mapping(
        &mut self,
        entity_type: &str,
        legacy_id: &RecordKey,
    ) -> Result<Option<MigrationMapping>> {
        if let Some(partition) = self.mappings.get(entity_type) {
            return Ok(partition.get(legacy_id).cloned());
        }
        Ok(self
            .store
            .lock()
            .mappings
            .get(entity_type)
            .and_then(|p| p.get(legacy_id).cloned()))
    }

    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<Row>> {
        match self.tables.get(&query.table) {
            Some(rows) => Ok(run_query(rows, query)),
            None => self.store.query(query),
        }
    }

    async fn upsert_row(
        &mut self,
        table: &TableRef,
        key_field: &str,
        row: &Row,
        preserve: &[String],
    ) -> Result<UpsertOutcome> {
        let key = row.get(key_field).cloned().ok_or_else(|| {
            MigrateError::constraint(table.to_string(), format!("{} is required", key_field))
        })?;

        // Work on a detached copy so a constraint failure leaves the
        // transaction's view unchanged.
        let mut rows = std::mem::take(self.table_mut(table));
        let position = rows.iter().position(|r| key_matches(r, key_field, &key));
        let (candidate, outcome) = match position {
            Some(idx) => {
                let mut merged = rows[idx].clone();
                for (name, value) in row.fields() {
                    if !preserve.contains(name) {
                        merged.insert(name.clone(), value.clone());
                    }
                }
                (merged, UpsertOutcome::Updated)
            }
            None => (row.clone(), UpsertOutcome::Inserted),
        };

        let checked = self.check_unique(table, &rows, key_field, &candidate);
        if checked.is_ok() {
            match position {
                Some(idx) => rows[idx] = candidate,
                None => rows.push(candidate),
            }
        }
        self.tables.insert(table.clone(), rows);
        checked.map(|_| outcome)
    }

    async fn delete_row(
        &mut self,
        table: &TableRef,
        key_field: &str,
        key: &Value,
    ) -> Result<bool> {
        let rows = self.table_mut(table);
        let before = rows.len();
        rows.retain(|r| !key_matches(r, key_field, key));
        Ok(rows.len() != before)
    }

    async fn put_mapping(&mut self, mapping: &MigrationMapping) -> Result<()> {
        let partition = self.partition_mut(&mapping.entity_type);
        match partition.get_mut(&mapping.legacy_id) {
            Some(existing) => {
                existing.checksum = mapping.checksum.clone();
                existing.validation_status = mapping.validation_status;
                existing.updated_at = mapping.updated_at;
            }
            None => {
                partition.insert(mapping.legacy_id.clone(), mapping.clone());
            }
        }
        Ok(())
    }

    async fn delete_mapping(&mut self, entity_type: &str, legacy_id: &RecordKey) -> Result<bool> {
        Ok(self.partition_mut(entity_type).remove(legacy_id).is_some())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let commits = {
            let mut state = this.store.lock();
            if state.commit_failures > 0 {
                state.commit_failures -= 1;
                return Err(MigrateError::Connection("injected failure on commit".into()));
            }
            state.tables.extend(this.tables);
            state.mappings.extend(this.mappings);
            state.commits += 1;
            state.commits
        };
        debug!(commits, "memory store commit");

        let hook = lock(&this.store.commit_hook).clone();
        if let Some(hook) = hook {
            hook(commits);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TableRef {
        TableRef::new("public", "doctors")
    }

    fn row(value: Value) -> Row {
        Row::from_json(value).unwrap()
    }

    #[tokio::test]
    async fn test_select_orders_filters_and_limits() {
        let store = MemoryStore::new();
        store.insert_rows(
            &table(),
            vec![
                row(json!({"id": 3, "name": "c"})),
                row(json!({"id": 1, "name": "a"})),
                row(json!({"id": 2, "name": "b"})),
            ],
        );
        let q = SelectQuery::on(table())
            .filter(crate::core::Predicate::gt("id", json!(1)))
            .order_by("id")
            .limit(1)
            .columns(&["id"]);
        let rows = SourceStore::select(&store, &q).await.unwrap();
        assert_eq!(rows, vec![row(json!({"id": 2}))]);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_row(&table(), "id", &row(json!({"id": "a"})), &[])
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert!(store.rows(&table()).is_empty());
    }

    #[tokio::test]
    async fn test_upsert_preserves_fields_on_update() {
        let store = MemoryStore::new();
        store.insert_row(
            &table(),
            row(json!({"id": "a", "name": "old", "reviewed_by": "ops"})),
        );
        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .upsert_row(
                &table(),
                "id",
                &row(json!({"id": "a", "name": "new", "reviewed_by": null})),
                &["reviewed_by".to_string()],
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        let stored = store.row(&table(), "id", &json!("a")).unwrap();
        assert_eq!(stored.get("name"), Some(&json!("new")));
        assert_eq!(stored.get("reviewed_by"), Some(&json!("ops")));
    }

    #[tokio::test]
    async fn test_unique_constraint_violation() {
        let store = MemoryStore::new();
        store.add_unique_constraint(&table(), "email");
        store.insert_row(&table(), row(json!({"id": "a", "email": "x@y"})));
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .upsert_row(&table(), "id", &row(json!({"id": "b", "email": "x@y"})), &[])
            .await
            .unwrap_err();
        assert!(err.is_batch_reducible());
        // Updating the owning row itself is fine.
        tx.upsert_row(&table(), "id", &row(json!({"id": "a", "email": "x@y"})), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_mapping_never_changes_new_id() {
        let store = MemoryStore::new();
        let first = MigrationMapping::assign("doctor", RecordKey::Int(1), "h1".into(), None);
        let mut tx = store.begin().await.unwrap();
        tx.put_mapping(&first).await.unwrap();
        tx.commit().await.unwrap();

        let mut imposter = first.clone();
        imposter.new_id = "something-else".into();
        imposter.checksum = "h2".into();
        let mut tx = store.begin().await.unwrap();
        tx.put_mapping(&imposter).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store
            .get_mapping("doctor", &RecordKey::Int(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.new_id, first.new_id);
        assert_eq!(stored.checksum, "h2");
    }

    #[tokio::test]
    async fn test_injected_commit_failure_rolls_back() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let mut tx = store.begin().await.unwrap();
        tx.upsert_row(&table(), "id", &row(json!({"id": 1})), &[])
            .await
            .unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.rows(&table()).is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_hook_sees_count() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.set_commit_hook(Arc::new(move |n| sink.lock().unwrap().push(n)));
        for _ in 0..2 {
            store.begin().await.unwrap().commit().await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
