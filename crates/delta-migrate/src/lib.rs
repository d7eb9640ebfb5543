//! # delta-migrate
//!
//! Incremental, resumable sync engine for moving data from a legacy
//! database into a new platform.
//!
//! The library provides:
//!
//! - **Differential detection** against a durable legacy-id to new-id mapping
//! - **Conflict resolution** with source-wins, target-wins or manual review
//! - **Dependency-ordered execution** in waves with a bounded worker pool
//! - **Checkpointed batches** that resume after the last committed key
//! - **Live progress** with throughput, ETA and alerts
//!
//! ## Example
//!
//! ```rust,no_run
//! use delta_migrate::{Config, SyncService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let service = SyncService::connect(&config, None).await?;
//!     let report = service.detect_changes(&[], None).await;
//!     let tasks = service.plan_tasks(&report.results)?;
//!     let result = service.execute(tasks).await?;
//!     println!("Processed {} records", result.records_processed);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod detect;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod progress;
pub mod resolve;
pub mod schema;
pub mod service;
pub mod session;
pub mod state;
pub mod store;

// Re-exports for convenient access
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStatus};
pub use config::{Config, ConflictPolicy, DatabaseConfig, ProgressConfig, SyncConfig};
pub use core::{RecordKey, Row, TableRef};
pub use detect::{ChangeRecord, ChangeType, DetectionResult, DifferentialDetector, MigrationTask};
pub use error::{ErrorKind, MigrateError, Result};
pub use executor::{ExecutionResult, ExecutorOptions, MigrationExecutor, RunControl};
pub use mapping::{MappingStore, MigrationMapping};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use resolve::ConflictResolver;
pub use schema::{EntityDescriptor, EntityTransformer, SchemaProvider, SchemaRegistry};
pub use service::{DetectionReport, StatusReport, SyncService};
pub use session::{EntityState, RunRecord, RunStatus};
pub use state::{FileStateBackend, MemoryStateBackend, PgStateBackend, StateBackend};
pub use store::{DestinationStore, MemoryStore, PgStore, SourceStore};
