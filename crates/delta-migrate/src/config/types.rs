//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::schema::{EntityDescriptor, FieldMapRules};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy (source) database.
    pub source: DatabaseConfig,

    /// Destination database. Also hosts mapping and state tables.
    pub target: DatabaseConfig,

    /// Sync engine behavior.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Progress tracking thresholds.
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Declarative entity schemas.
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

/// PostgreSQL connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "disable").
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Pool size. Defaults to twice the entity concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// How a detected differential is applied to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Overwrite destination fields from source.
    #[default]
    SourceWins,

    /// Leave the destination untouched and record the record as skipped.
    TargetWins,

    /// Defer to the manual review queue.
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::SourceWins => "source_wins",
            ConflictPolicy::TargetWins => "target_wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

/// Sync engine behavior.
/// Tunables are Option<T> so an unset value is distinguishable from an
/// explicit one; the getters return the effective value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    /// Records per batch, 1..=5000 (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Smallest batch size bisection reduces to (default: 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_batch_size: Option<usize>,

    /// Committed batches between checkpoint writes (default: 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_interval: Option<usize>,

    /// Entities processed concurrently within a wave (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_entities: Option<usize>,

    /// Retries of a batch after a transient failure (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// First retry delay in milliseconds (default: 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Retry delay cap in milliseconds (default: 10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_delay_ms: Option<u64>,

    /// Per-run timeout. No new batches start once it elapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Detect deletions (default: true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_deletes: Option<bool>,

    /// Conflict policy (default: source_wins).
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Snapshot affected destination rows before resolution (default: false).
    #[serde(default)]
    pub snapshot_before_resolve: bool,

    /// Directory receiving snapshot files. Required with
    /// `snapshot_before_resolve`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<String>,

    /// JSON-lines file for the manual review queue. When unset the queue
    /// lives in the state schema, or beside the state file if one is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_queue_file: Option<String>,

    /// Age after which non-resumable checkpoints are removed (default: 30).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_retention_days: Option<u32>,

    /// Run lease duration in seconds (default: 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl_secs: Option<u64>,

    /// Schema holding mapping and state tables (default: "_delta_migrate").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_schema: Option<String>,
}

impl SyncConfig {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(500)
    }

    pub fn get_min_batch_size(&self) -> usize {
        self.min_batch_size.unwrap_or(1)
    }

    pub fn get_checkpoint_interval(&self) -> usize {
        self.checkpoint_interval.unwrap_or(10)
    }

    pub fn get_max_concurrent_entities(&self) -> usize {
        self.max_concurrent_entities.unwrap_or(4)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn get_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.unwrap_or(200))
    }

    pub fn get_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms.unwrap_or(10_000))
    }

    pub fn get_run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn get_include_deletes(&self) -> bool {
        self.include_deletes.unwrap_or(true)
    }

    pub fn get_checkpoint_retention_days(&self) -> u32 {
        self.checkpoint_retention_days.unwrap_or(30)
    }

    pub fn get_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.unwrap_or(300))
    }

    pub fn get_state_schema(&self) -> &str {
        self.state_schema.as_deref().unwrap_or("_delta_migrate")
    }
}

/// Progress tracking thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressConfig {
    /// Minimum interval between non-terminal updates (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_update_interval_ms: Option<u64>,

    /// Records/sec below which a low-throughput alert fires (default: 1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_throughput_threshold: Option<f64>,

    /// Failed/processed fraction above which an alert fires (default: 0.05).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_failure_rate: Option<f64>,

    /// Seconds before throughput alerts are evaluated (default: 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_secs: Option<u64>,
}

impl ProgressConfig {
    pub fn get_min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms.unwrap_or(500))
    }

    pub fn get_low_throughput_threshold(&self) -> f64 {
        self.low_throughput_threshold.unwrap_or(1.0)
    }

    pub fn get_high_failure_rate(&self) -> f64 {
        self.high_failure_rate.unwrap_or(0.05)
    }

    pub fn get_warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs.unwrap_or(10))
    }
}

/// One declarative entity: a descriptor plus its field map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(flatten)]
    pub descriptor: EntityDescriptor,

    #[serde(default)]
    pub transform: FieldMapRules,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}
