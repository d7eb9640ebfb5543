//! Configuration validation.

use super::{Config, DatabaseConfig};
use crate::error::{MigrateError, Result};
use crate::executor::plan::{dependency_waves, WaveNode};
use crate::schema::SchemaRegistry;
use crate::store::SslMode;

const MAX_BATCH_SIZE: usize = 5000;

fn validate_database(section: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", section)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.database is required",
            section
        )));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", section)));
    }
    if SslMode::parse(&db.ssl_mode).is_err() {
        return Err(MigrateError::Config(format!(
            "{}.ssl_mode must be one of {}; got '{}'",
            section,
            SslMode::VALID,
            db.ssl_mode
        )));
    }
    if let Some(0) = db.max_connections {
        return Err(MigrateError::Config(format!(
            "{}.max_connections must be at least 1",
            section
        )));
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("source", &config.source)?;
    validate_database("target", &config.target)?;

    let sync = &config.sync;
    if let Some(size) = sync.batch_size {
        if size == 0 || size > MAX_BATCH_SIZE {
            return Err(MigrateError::Config(format!(
                "sync.batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, size
            )));
        }
    }
    if sync.get_min_batch_size() == 0 || sync.get_min_batch_size() > sync.get_batch_size() {
        return Err(MigrateError::Config(
            "sync.min_batch_size must be between 1 and sync.batch_size".into(),
        ));
    }
    if let Some(0) = sync.checkpoint_interval {
        return Err(MigrateError::Config(
            "sync.checkpoint_interval must be at least 1".into(),
        ));
    }
    if let Some(0) = sync.max_concurrent_entities {
        return Err(MigrateError::Config(
            "sync.max_concurrent_entities must be at least 1".into(),
        ));
    }
    if sync.get_retry_base_delay() > sync.get_retry_max_delay() {
        return Err(MigrateError::Config(
            "sync.retry_base_delay_ms cannot exceed sync.retry_max_delay_ms".into(),
        ));
    }
    if let Some(0) = sync.lease_ttl_secs {
        return Err(MigrateError::Config(
            "sync.lease_ttl_secs must be at least 1".into(),
        ));
    }
    if sync.snapshot_before_resolve && sync.snapshot_dir.as_deref().map_or(true, str::is_empty) {
        return Err(MigrateError::Config(
            "sync.snapshot_dir is required when sync.snapshot_before_resolve is set".into(),
        ));
    }
    if let Some("") = sync.review_queue_file.as_deref() {
        return Err(MigrateError::Config(
            "sync.review_queue_file cannot be empty".into(),
        ));
    }
    let schema = sync.get_state_schema();
    if schema.is_empty() || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MigrateError::Config(format!(
            "sync.state_schema must be a plain identifier, got '{}'",
            schema
        )));
    }

    let progress = &config.progress;
    if !(0.0..=1.0).contains(&progress.get_high_failure_rate()) {
        return Err(MigrateError::Config(
            "progress.high_failure_rate must be between 0 and 1".into(),
        ));
    }
    if progress.get_low_throughput_threshold() < 0.0 {
        return Err(MigrateError::Config(
            "progress.low_throughput_threshold cannot be negative".into(),
        ));
    }

    // Descriptor checks, duplicate names and unknown dependencies.
    SchemaRegistry::from_config(&config.entities)?;

    let nodes: Vec<WaveNode> = config
        .entities
        .iter()
        .map(|e| WaveNode {
            name: e.descriptor.entity_type.clone(),
            dependencies: e.descriptor.dependencies.clone(),
            priority: e.descriptor.priority,
        })
        .collect();
    dependency_waves(&nodes)?;

    Ok(())
}
