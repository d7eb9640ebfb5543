//! CLI integration tests for delta-migrate.
//!
//! These tests cover argument parsing, help output and the exit codes of
//! configuration errors. Nothing here needs a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn cmd() -> Command {
    Command::cargo_bin("delta-migrate").unwrap()
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("detect"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("pause"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("review"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_detect_subcommand_help() {
    cmd()
        .args(["detect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--entity"))
        .stdout(predicate::str::contains("--since"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--entity"))
        .stdout(predicate::str::contains("--since"))
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("Detect and plan only"));
}

#[test]
fn test_review_subcommand_help() {
    cmd()
        .args(["review", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--run"))
        .stdout(predicate::str::contains("manual conflict policy"));
}

#[test]
fn test_cancel_subcommand_help() {
    cmd()
        .args(["cancel", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--force"))
        .stdout(predicate::str::contains("resumable"));
}

#[test]
fn test_status_subcommand_help() {
    cmd()
        .args(["status", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--limit"))
        .stdout(predicate::str::contains("[default: 20]"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("delta-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_listed() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--progress"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_log_format_and_verbosity_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

// =============================================================================
// Argument Validation Tests
// =============================================================================

#[test]
fn test_invalid_since_rejected() {
    cmd()
        .args(["detect", "--since", "yesterday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid RFC 3339 timestamp"));
}

#[test]
fn test_resume_requires_id() {
    cmd()
        .arg("resume")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<ID>"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    // A missing file is an IO error, not a configuration error.
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let file = config_file("invalid: yaml: content: [\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("YAML error"));
}

#[test]
fn test_empty_config_exits_with_code_2() {
    let file = config_file("");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_target_exits_with_code_2() {
    let file = config_file("source:\n  host: legacy-db\n  database: legacy\n  user: sync\n");

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status"])
        .assert()
        .code(2);
}

#[test]
fn test_snapshots_without_directory_exit_with_code_2() {
    let file = config_file(
        "source: { host: legacy-db, database: legacy, user: sync }\n\
         target: { host: platform-db, database: platform, user: sync }\n\
         sync:\n  snapshot_before_resolve: true\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("sync.snapshot_dir"));
}

#[test]
fn test_unsupported_ssl_mode_exits_with_code_2() {
    let file = config_file(
        "source: { host: legacy-db, database: legacy, user: sync, ssl_mode: allow }\n\
         target: { host: platform-db, database: platform, user: sync }\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("source.ssl_mode"));
}

#[test]
fn test_invalid_batch_size_exits_with_code_2() {
    let file = config_file(
        "source: { host: legacy-db, database: legacy, user: sync }\n\
         target: { host: platform-db, database: platform, user: sync }\n\
         sync:\n  batch_size: 0\n",
    );

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("batch_size"));
}
