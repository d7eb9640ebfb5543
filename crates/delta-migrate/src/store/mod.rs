//! Source and destination store capabilities.
//!
//! The engine only needs point SELECTs with predicate/order/limit, a
//! multi-statement transaction, and upsert by unique key. Each backend
//! expresses those in its own dialect.

mod memory;
mod postgres;
mod tls;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use tls::{SslMode, TlsBuilder};
pub(crate) use postgres::quote_ident;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{RecordKey, Row, SelectQuery, TableRef};
use crate::error::Result;
use crate::mapping::{MappingStore, MigrationMapping};

/// Outcome of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Read-only legacy store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<()>;

    fn store_type(&self) -> &str;
}

/// Destination store: rows plus the identity mapping table.
#[async_trait]
pub trait DestinationStore: MappingStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>>;

    /// Open a transaction. Everything written through it commits or rolls
    /// back together.
    async fn begin(&self) -> Result<Box<dyn DestinationTx>>;

    async fn ping(&self) -> Result<()>;

    fn store_type(&self) -> &str;
}

/// An open destination transaction.
#[async_trait]
pub trait DestinationTx: Send {
    async fn get_mapping(
        &mut self,
        entity_type: &str,
        legacy_id: &RecordKey,
    ) -> Result<Option<MigrationMapping>>;

    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<Row>>;

    /// Insert `row`, or update the row whose `key_field` matches. On update,
    /// fields in `preserve` keep their destination values.
    async fn upsert_row(
        &mut self,
        table: &TableRef,
        key_field: &str,
        row: &Row,
        preserve: &[String],
    ) -> Result<UpsertOutcome>;

    /// Delete the row whose `key_field` equals `key`. Returns whether a row
    /// was removed.
    async fn delete_row(&mut self, table: &TableRef, key_field: &str, key: &Value)
        -> Result<bool>;

    /// Insert or refresh a mapping. An existing row keeps its `new_id`.
    async fn put_mapping(&mut self, mapping: &MigrationMapping) -> Result<()>;

    async fn delete_mapping(&mut self, entity_type: &str, legacy_id: &RecordKey) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
