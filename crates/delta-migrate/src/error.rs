//! Error types for the sync engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Transient store connectivity problem. Retryable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Source row does not fit the shape the transformer expects.
    /// Never retried; aborts the record only.
    #[error("Validation error for {entity} record {record}: {message}")]
    Validation {
        entity: String,
        record: String,
        message: String,
    },

    /// Destination-side constraint violation. Rolls back the batch.
    #[error("Constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    /// Progress persistence failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Differential could not be resolved (unsupported type, missing mapping).
    #[error("Conflict resolution failed for {entity} record {record}: {message}")]
    ConflictResolution {
        entity: String,
        record: String,
        message: String,
    },

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task dependencies contain a cycle.
    #[error("Dependency cycle detected between entities: {0}")]
    DependencyCycle(String),

    /// Entity type is not registered with the schema provider.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// A run, checkpoint or record could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another executor instance holds the run lease.
    #[error("Run {run_id} is leased by {owner} until {expires_at}")]
    LeaseHeld {
        run_id: String,
        owner: String,
        expires_at: String,
    },

    /// State backend error.
    #[error("State error: {0}")]
    State(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// PostgreSQL error not otherwise classified.
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled.
    #[error("Migration cancelled")]
    Cancelled,
}

/// Stable error classification used in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Validation,
    Constraint,
    Checkpoint,
    ConflictResolution,
    Configuration,
    State,
    Cancelled,
    Other,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn validation(
        entity: impl Into<String>,
        record: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        MigrateError::Validation {
            entity: entity.into(),
            record: record.to_string(),
            message: message.into(),
        }
    }

    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Constraint {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn conflict(
        entity: impl Into<String>,
        record: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        MigrateError::ConflictResolution {
            entity: entity.into(),
            record: record.to_string(),
            message: message.into(),
        }
    }

    /// Classify a PostgreSQL error by SQLSTATE class.
    ///
    /// Class 23 (integrity constraint violation) becomes `Constraint`,
    /// class 08 and closed connections become `Connection`.
    pub fn from_pg(err: tokio_postgres::Error, table: &str) -> Self {
        if err.is_closed() {
            return MigrateError::Connection(err.to_string());
        }
        match err.code().map(|c| c.code().to_string()) {
            Some(code) if code.starts_with("23") => MigrateError::Constraint {
                table: table.to_string(),
                message: err
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| err.to_string()),
            },
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                MigrateError::Connection(err.to_string())
            }
            None => MigrateError::Connection(err.to_string()),
            _ => MigrateError::Postgres(err),
        }
    }

    /// Transient failures that may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrateError::Connection(_) | MigrateError::Pool { .. })
    }

    /// Failures that roll back a batch and may succeed at a smaller size.
    pub fn is_batch_reducible(&self) -> bool {
        matches!(self, MigrateError::Constraint { .. })
    }

    /// Failures confined to a single record.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            MigrateError::Validation { .. } | MigrateError::ConflictResolution { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Connection(_) | MigrateError::Pool { .. } => ErrorKind::Connection,
            MigrateError::Validation { .. } => ErrorKind::Validation,
            MigrateError::Constraint { .. } => ErrorKind::Constraint,
            MigrateError::Checkpoint(_) => ErrorKind::Checkpoint,
            MigrateError::ConflictResolution { .. } => ErrorKind::ConflictResolution,
            MigrateError::Config(_)
            | MigrateError::DependencyCycle(_)
            | MigrateError::UnknownEntity(_)
            | MigrateError::Yaml(_) => ErrorKind::Configuration,
            MigrateError::State(_) | MigrateError::LeaseHeld { .. } | MigrateError::NotFound(_) => {
                ErrorKind::State
            }
            MigrateError::Cancelled => ErrorKind::Cancelled,
            MigrateError::Postgres(_) | MigrateError::Io(_) | MigrateError::Json(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Connection => 3,
            ErrorKind::Checkpoint | ErrorKind::State => 4,
            ErrorKind::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
