//! PostgreSQL store.
//!
//! Rows travel as JSON: reads wrap the SELECT in `row_to_json`, and every
//! bound value is passed as a `jsonb` object and coerced to the column's own
//! type through `jsonb_populate_record(NULL::<table>, ..)`. No per-column type
//! mapping is needed on this side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{debug, info, warn};

use super::tls::{SslMode, TlsBuilder};
use super::{DestinationStore, DestinationTx, SourceStore, UpsertOutcome};
use crate::config::DatabaseConfig;
use crate::core::{Predicate, RecordKey, Row, SelectQuery, TableRef};
use crate::error::{MigrateError, Result};
use crate::mapping::{MappingStore, MigrationMapping};

/// PostgreSQL-backed source and/or destination store.
pub struct PgStore {
    pool: Pool,
    schema: String,
    label: String,
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualify(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
        None => quote_ident(&table.name),
    }
}

/// Expression yielding `value` typed as `table.field`.
fn typed_param(table: &str, field: &str, idx: usize) -> String {
    format!(
        "(jsonb_populate_record(NULL::{}, ${}::jsonb)).{}",
        table,
        idx,
        quote_ident(field)
    )
}

fn param_object(field: &str, value: &Value) -> Value {
    json!({ field: value })
}

/// Build the SQL and jsonb parameters for a [`SelectQuery`].
fn build_select(query: &SelectQuery) -> (String, Vec<Value>) {
    let table = qualify(&query.table);
    let mut params = Vec::new();
    let mut conditions = Vec::new();

    for predicate in &query.predicates {
        let col = quote_ident(predicate.field());
        let condition = match predicate {
            Predicate::IsNull { .. } => format!("{} IS NULL", col),
            Predicate::In { field, values } => {
                if values.is_empty() {
                    "FALSE".to_string()
                } else {
                    params.push(Value::Array(
                        values.iter().map(|v| param_object(field, v)).collect(),
                    ));
                    format!(
                        "{} IN (SELECT (jsonb_populate_record(NULL::{}, e)).{} \
                         FROM jsonb_array_elements(${}::jsonb) e)",
                        col,
                        table,
                        col,
                        params.len()
                    )
                }
            }
            Predicate::Eq { field, value }
            | Predicate::NotEq { field, value }
            | Predicate::Gt { field, value }
            | Predicate::GtOrNull { field, value } => {
                params.push(param_object(field, value));
                let rhs = typed_param(&table, field, params.len());
                match predicate {
                    Predicate::Eq { .. } => format!("{} = {}", col, rhs),
                    Predicate::NotEq { .. } => format!("{} <> {}", col, rhs),
                    Predicate::Gt { .. } => format!("{} > {}", col, rhs),
                    _ => format!("({} > {} OR {} IS NULL)", col, rhs, col),
                }
            }
        };
        conditions.push(condition);
    }

    let projection = if query.columns.is_empty() {
        "*".to_string()
    } else {
        query
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!("SELECT {} FROM {}", projection, table);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if let Some(order) = &query.order_by {
        sql.push_str(&format!(" ORDER BY {}", quote_ident(order)));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    (format!("SELECT row_to_json(s) FROM ({}) s", sql), params)
}

/// INSERT .. ON CONFLICT for one row. `$1` is the row as jsonb.
fn build_upsert(table: &TableRef, key_field: &str, fields: &[String], preserve: &[String]) -> String {
    let table = qualify(table);
    let cols: Vec<String> = fields.iter().map(|f| quote_ident(f)).collect();
    let updates: Vec<String> = fields
        .iter()
        .filter(|f| f.as_str() != key_field && !preserve.contains(f))
        .map(|f| format!("{} = EXCLUDED.{}", quote_ident(f), quote_ident(f)))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({key}) {action} RETURNING (xmax = 0) AS inserted",
        table = table,
        cols = cols.join(", "),
        key = quote_ident(key_field),
        action = action,
    )
}

fn as_params(values: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn mapping_from_row(row: &tokio_postgres::Row) -> Result<MigrationMapping> {
    let legacy: String = row.try_get("legacy_id")?;
    let status: String = row.try_get("validation_status")?;
    Ok(MigrationMapping {
        entity_type: row.try_get("entity_type")?,
        legacy_id: RecordKey::decode(&legacy)?,
        new_id: row.try_get("new_id")?,
        checksum: row.try_get("checksum")?,
        validation_status: status.parse()?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
    })
}

const MAPPING_COLUMNS: &str =
    "entity_type, legacy_id, new_id, checksum, validation_status, created_at, updated_at";

async fn select_rows(client: &Client, query: &SelectQuery) -> Result<Vec<Row>> {
    let (sql, params) = build_select(query);
    debug!(table = %query.table, "select: {}", sql);
    let rows = client
        .query(sql.as_str(), &as_params(&params))
        .await
        .map_err(|e| MigrateError::from_pg(e, &query.table.to_string()))?;
    rows.iter()
        .map(|r| {
            let value: Value = r.try_get(0)?;
            Row::from_json(value)
        })
        .collect()
}

async fn fetch_mapping(
    client: &Client,
    schema: &str,
    entity_type: &str,
    legacy_id: &RecordKey,
) -> Result<Option<MigrationMapping>> {
    let sql = format!(
        "SELECT {} FROM {}.migration_mappings WHERE entity_type = $1 AND legacy_id = $2",
        MAPPING_COLUMNS, schema
    );
    let row = client
        .query_opt(sql.as_str(), &[&entity_type, &legacy_id.encode()])
        .await
        .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
    row.as_ref().map(mapping_from_row).transpose()
}

impl PgStore {
    /// Connect a pool and verify it with a round trip.
    pub async fn connect(config: &DatabaseConfig, max_conns: usize, schema: &str) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        pg_config.ssl_mode(ssl_mode.negotiation());

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match TlsBuilder::new(ssl_mode).build()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        let store = Self {
            pool,
            schema: quote_ident(schema),
            label: format!("{}:{}/{}", config.host, config.port, config.database),
        };
        store.ping_inner().await?;

        info!("Connected to PostgreSQL: {}", store.label);
        Ok(store)
    }

    /// Shared pool, for state backends living in the same database.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), context))
    }

    async fn ping_inner(&self) -> Result<()> {
        let client = self.client("health check").await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::from_pg(e, &self.label))?;
        Ok(())
    }

    /// Create the state schema and the mapping table.
    pub async fn init_mappings(&self) -> Result<()> {
        let client = self.client("initializing mapping table").await?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {schema}.migration_mappings (
                    entity_type TEXT NOT NULL,
                    legacy_id TEXT NOT NULL,
                    new_id TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    validation_status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (validation_status IN ('pending', 'valid', 'invalid')),
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (entity_type, legacy_id)
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_migration_mappings_new_id
                    ON {schema}.migration_mappings(entity_type, new_id);",
                schema = self.schema
            ))
            .await
            .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
        Ok(())
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let client = self.client("source select").await?;
        select_rows(&client, query).await
    }

    async fn ping(&self) -> Result<()> {
        self.ping_inner().await
    }

    fn store_type(&self) -> &str {
        "postgres"
    }
}

#[async_trait]
impl MappingStore for PgStore {
    async fn get_mapping(
        &self,
        entity_type: &str,
        legacy_id: &RecordKey,
    ) -> Result<Option<MigrationMapping>> {
        let client = self.client("mapping lookup").await?;
        fetch_mapping(&client, &self.schema, entity_type, legacy_id).await
    }

    async fn get_mappings(
        &self,
        entity_type: &str,
        legacy_ids: &[RecordKey],
    ) -> Result<HashMap<RecordKey, MigrationMapping>> {
        if legacy_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let client = self.client("mapping lookup").await?;
        let encoded: Vec<String> = legacy_ids.iter().map(RecordKey::encode).collect();
        let sql = format!(
            "SELECT {} FROM {}.migration_mappings WHERE entity_type = $1 AND legacy_id = ANY($2)",
            MAPPING_COLUMNS, self.schema
        );
        let rows = client
            .query(sql.as_str(), &[&entity_type, &encoded])
            .await
            .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
        rows.iter()
            .map(|r| mapping_from_row(r).map(|m| (m.legacy_id.clone(), m)))
            .collect()
    }

    async fn list_mappings(
        &self,
        entity_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationMapping>> {
        let client = self.client("mapping scan").await?;
        let sql = format!(
            "SELECT {} FROM {}.migration_mappings WHERE entity_type = $1
             ORDER BY legacy_id OFFSET $2 LIMIT $3",
            MAPPING_COLUMNS, self.schema
        );
        let rows = client
            .query(
                sql.as_str(),
                &[&entity_type, &(offset as i64), &(limit as i64)],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn count_mappings(&self, entity_type: &str) -> Result<u64> {
        let client = self.client("mapping count").await?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}.migration_mappings WHERE entity_type = $1",
            self.schema
        );
        let row = client
            .query_one(sql.as_str(), &[&entity_type])
            .await
            .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let client = self.client("destination select").await?;
        select_rows(&client, query).await
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTx>> {
        let client = self.client("opening destination transaction").await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| MigrateError::from_pg(e, "BEGIN"))?;
        Ok(Box::new(PgTx {
            client: Some(client),
            schema: self.schema.clone(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.ping_inner().await
    }

    fn store_type(&self) -> &str {
        "postgres"
    }
}

/// A transaction pinned to one pooled connection.
///
/// A transaction dropped without commit or rollback detaches its connection
/// from the pool, so an open transaction is never handed to another caller.
struct PgTx {
    client: Option<Object>,
    schema: String,
}

impl PgTx {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .map(|c| &***c)
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))?;
        match client.batch_execute(statement).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(Object::take(client));
                Err(MigrateError::from_pg(e, statement))
            }
        }
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl DestinationTx for PgTx {
    async fn get_mapping(
        &mut self,
        entity_type: &str,
        legacy_id: &RecordKey,
    ) -> Result<Option<MigrationMapping>> {
        fetch_mapping(self.client()?, &self.schema, entity_type, legacy_id).await
    }

    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<Row>> {
        select_rows(self.client()?, query).await
    }

    async fn upsert_row(
        &mut self,
        table: &TableRef,
        key_field: &str,
        row: &Row,
        preserve: &[String],
    ) -> Result<UpsertOutcome> {
        let fields = row.field_names();
        let sql = build_upsert(table, key_field, &fields, preserve);
        let payload = row.clone().into_json();
        let result = self
            .client()?
            .query_opt(sql.as_str(), &[&payload])
            .await
            .map_err(|e| MigrateError::from_pg(e, &table.to_string()))?;
        match result {
            Some(r) if r.try_get::<_, bool>("inserted")? => Ok(UpsertOutcome::Inserted),
            _ => Ok(UpsertOutcome::Updated),
        }
    }

    async fn delete_row(
        &mut self,
        table: &TableRef,
        key_field: &str,
        key: &Value,
    ) -> Result<bool> {
        let qualified = qualify(table);
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            qualified,
            quote_ident(key_field),
            typed_param(&qualified, key_field, 1)
        );
        let payload = param_object(key_field, key);
        let n = self
            .client()?
            .execute(sql.as_str(), &[&payload])
            .await
            .map_err(|e| MigrateError::from_pg(e, &table.to_string()))?;
        Ok(n > 0)
    }

    async fn put_mapping(&mut self, mapping: &MigrationMapping) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.migration_mappings ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (entity_type, legacy_id) DO UPDATE SET
                checksum = EXCLUDED.checksum,
                validation_status = EXCLUDED.validation_status,
                updated_at = EXCLUDED.updated_at",
            self.schema, MAPPING_COLUMNS
        );
        self.client()?
            .execute(
                sql.as_str(),
                &[
                    &mapping.entity_type,
                    &mapping.legacy_id.encode(),
                    &mapping.new_id,
                    &mapping.checksum,
                    &mapping.validation_status.as_str(),
                    &mapping.created_at,
                    &mapping.updated_at,
                ],
            )
            .await
            .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
        Ok(())
    }

    async fn delete_mapping(&mut self, entity_type: &str, legacy_id: &RecordKey) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {}.migration_mappings WHERE entity_type = $1 AND legacy_id = $2",
            self.schema
        );
        let n = self
            .client()?
            .execute(sql.as_str(), &[&entity_type, &legacy_id.encode()])
            .await
            .map_err(|e| MigrateError::from_pg(e, "migration_mappings"))?;
        Ok(n > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}
