//! Live progress for runs.
//!
//! Each run gets a broadcast channel. Updates are published at batch-commit
//! boundaries, throttled to a minimum interval, and are best effort: a slow
//! subscriber that lags simply receives the next snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::ProgressConfig;
use crate::session::{RunRecord, RunStatus};

const CHANNEL_CAPACITY: usize = 64;

/// Threshold alert kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowThroughput,
    HighFailureRate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub records_total: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub percent_complete: f64,
    /// Records per second since the run (re)started in this process.
    pub throughput: f64,
    pub eta_seconds: Option<f64>,
    pub elapsed_seconds: f64,
    pub running_entities: Vec<String>,
    pub alerts: Vec<Alert>,
    pub updated_at: DateTime<Utc>,
}

/// Alert thresholds and throttling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSettings {
    pub min_update_interval: Duration,
    pub low_throughput_threshold: f64,
    pub high_failure_rate: f64,
    /// No throughput alert before this much time has elapsed.
    pub warmup: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self::from_config(&ProgressConfig::default())
    }
}

impl ProgressSettings {
    pub fn from_config(config: &ProgressConfig) -> Self {
        Self {
            min_update_interval: config.get_min_update_interval(),
            low_throughput_threshold: config.get_low_throughput_threshold(),
            high_failure_rate: config.get_high_failure_rate(),
            warmup: config.get_warmup(),
        }
    }
}

struct RunProgress {
    sender: broadcast::Sender<ProgressSnapshot>,
    status: RunStatus,
    started: Instant,
    last_published: Option<Instant>,
    records_total: u64,
    /// Processed before this process picked the run up (resume).
    baseline: u64,
    processed: u64,
    failed: u64,
    running: BTreeSet<String>,
}

impl RunProgress {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            status: RunStatus::Queued,
            started: Instant::now(),
            last_published: None,
            records_total: 0,
            baseline: 0,
            processed: 0,
            failed: 0,
            running: BTreeSet::new(),
        }
    }
}

/// Tracks live runs and publishes [`ProgressSnapshot`]s to subscribers.
#[derive(Clone)]
pub struct ProgressTracker {
    settings: ProgressSettings,
    runs: Arc<Mutex<HashMap<String, RunProgress>>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ProgressSettings::default())
    }
}

impl ProgressTracker {
    pub fn new(settings: ProgressSettings) -> Self {
        Self {
            settings,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, RunProgress>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a run that is about to execute, so callers can
    /// subscribe before its first update.
    pub fn register(&self, run_id: &str) {
        self.runs()
            .entry(run_id.to_string())
            .or_insert_with(RunProgress::new);
    }

    /// Subscribe to a run's updates.
    ///
    /// A run that is not tracked here yields a receiver that is already
    /// closed; nothing is allocated for it.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<ProgressSnapshot> {
        match self.runs().get(run_id) {
            Some(run) => run.sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn is_tracked(&self, run_id: &str) -> bool {
        self.runs().contains_key(run_id)
    }

    /// Begin tracking execution. `already_processed` counts records done
    /// before a resume and is excluded from throughput.
    pub fn start_run(&self, run_id: &str, records_total: u64, already_processed: u64) {
        let mut runs = self.runs();
        let run = runs.entry(run_id.to_string()).or_insert_with(RunProgress::new);
        run.status = RunStatus::Running;
        run.started = Instant::now();
        run.records_total = records_total;
        run.baseline = already_processed;
        run.processed = already_processed;
        run.failed = 0;
        run.running.clear();
        self.publish(run_id, run, true);
    }

    pub fn entity_started(&self, run_id: &str, entity_type: &str) {
        if let Some(run) = self.runs().get_mut(run_id) {
            run.running.insert(entity_type.to_string());
        }
    }

    pub fn entity_finished(&self, run_id: &str, entity_type: &str) {
        if let Some(run) = self.runs().get_mut(run_id) {
            run.running.remove(entity_type);
        }
    }

    /// Record a committed batch and publish if the throttle allows.
    pub fn record_batch(&self, run_id: &str, processed: u64, failed: u64) {
        let mut runs = self.runs();
        if let Some(run) = runs.get_mut(run_id) {
            run.processed += processed;
            run.failed += failed;
            self.publish(run_id, run, false);
        }
    }

    /// Publish the final snapshot of an execution and stop tracking it.
    /// Subscribers still receive the final snapshot, then see the channel
    /// close.
    pub fn finish_run(&self, run_id: &str, status: RunStatus) {
        let mut runs = self.runs();
        if let Some(mut run) = runs.remove(run_id) {
            run.status = status;
            run.running.clear();
            self.publish(run_id, &mut run, true);
        }
    }

    /// Stop tracking a run without a final update, e.g. after an
    /// execution error.
    pub fn release(&self, run_id: &str) {
        if self.runs().remove(run_id).is_some() {
            debug!(run_id, "progress tracking released");
        }
    }

    /// Latest snapshot of a run tracked by this process.
    pub fn snapshot(&self, run_id: &str) -> Option<ProgressSnapshot> {
        self.runs()
            .get(run_id)
            .map(|run| self.build_snapshot(run_id, run))
    }

    /// Snapshot derived from a persisted run, for runs not live here.
    pub fn snapshot_from_run(&self, run: &RunRecord) -> ProgressSnapshot {
        let processed = run.total_processed();
        let total = run.total_records();
        let mut snapshot = ProgressSnapshot {
            run_id: run.run_id.clone(),
            status: run.status(),
            records_total: total,
            records_processed: processed,
            records_failed: run.total_failed(),
            percent_complete: percent(processed, total),
            throughput: 0.0,
            eta_seconds: None,
            elapsed_seconds: 0.0,
            running_entities: run.sets().running,
            alerts: Vec::new(),
            updated_at: run.updated_at,
        };
        snapshot.alerts = self.failure_alert(processed, snapshot.records_failed).into_iter().collect();
        snapshot
    }

    fn publish(&self, run_id: &str, run: &mut RunProgress, force: bool) {
        let now = Instant::now();
        let due = run
            .last_published
            .map_or(true, |t| now.duration_since(t) >= self.settings.min_update_interval);
        if !force && !due {
            return;
        }
        run.last_published = Some(now);
        let snapshot = self.build_snapshot(run_id, run);
        for alert in &snapshot.alerts {
            warn!(run_id, kind = ?alert.kind, "{}", alert.message);
        }
        // No subscribers is fine; updates are best effort.
        if run.sender.send(snapshot).is_err() {
            debug!(run_id, "no progress subscribers");
        }
    }

    fn build_snapshot(&self, run_id: &str, run: &RunProgress) -> ProgressSnapshot {
        let elapsed = run.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let done_here = run.processed.saturating_sub(run.baseline);
        let throughput = if secs > 0.0 { done_here as f64 / secs } else { 0.0 };
        let remaining = run.records_total.saturating_sub(run.processed);
        let eta_seconds = if remaining == 0 {
            Some(0.0)
        } else if throughput > 0.0 {
            Some(remaining as f64 / throughput)
        } else {
            None
        };

        let mut alerts = Vec::new();
        if run.status == RunStatus::Running
            && elapsed >= self.settings.warmup
            && throughput < self.settings.low_throughput_threshold
        {
            alerts.push(Alert {
                kind: AlertKind::LowThroughput,
                message: format!(
                    "throughput {:.2} rec/s below threshold {:.2} rec/s",
                    throughput, self.settings.low_throughput_threshold
                ),
            });
        }
        alerts.extend(self.failure_alert(run.processed, run.failed));

        ProgressSnapshot {
            run_id: run_id.to_string(),
            status: run.status,
            records_total: run.records_total,
            records_processed: run.processed,
            records_failed: run.failed,
            percent_complete: percent(run.processed, run.records_total),
            throughput,
            eta_seconds,
            elapsed_seconds: secs,
            running_entities: run.running.iter().cloned().collect(),
            alerts,
            updated_at: Utc::now(),
        }
    }

    fn failure_alert(&self, processed: u64, failed: u64) -> Option<Alert> {
        if processed == 0 {
            return None;
        }
        let rate = failed as f64 / processed as f64;
        (rate > self.settings.high_failure_rate).then(|| Alert {
            kind: AlertKind::HighFailureRate,
            message: format!(
                "failure rate {:.1}% above threshold {:.1}%",
                rate * 100.0,
                self.settings.high_failure_rate * 100.0
            ),
        })
    }
}

fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (processed as f64 / total as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(interval_ms: u64) -> ProgressSettings {
        ProgressSettings {
            min_update_interval: Duration::from_millis(interval_ms),
            low_throughput_threshold: 1.0,
            high_failure_rate: 0.05,
            warmup: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_updates() {
        let tracker = ProgressTracker::new(settings(0));
        let mut rx = tracker.subscribe("run-1");
        tracker.start_run("run-1", 100, 0);
        tracker.record_batch("run-1", 25, 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, RunStatus::Running);
        assert_eq!(first.records_processed, 0);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.records_processed, 25);
        assert_eq!(second.percent_complete, 25.0);
    }

    #[tokio::test]
    async fn test_updates_are_throttled() {
        let tracker = ProgressTracker::new(settings(60_000));
        let mut rx = tracker.subscribe("run-1");
        tracker.start_run("run-1", 100, 0);
        for _ in 0..10 {
            tracker.record_batch("run-1", 5, 0);
        }
        tracker.finish_run("run-1", RunStatus::Completed);

        let start = rx.recv().await.unwrap();
        assert_eq!(start.records_processed, 0);
        // Batch updates fall inside the interval; only the final one follows.
        let last = rx.recv().await.unwrap();
        assert_eq!(last.status, RunStatus::Completed);
        assert_eq!(last.records_processed, 50);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finished_runs_are_pruned() {
        let tracker = ProgressTracker::new(settings(0));
        tracker.register("run-1");
        let mut rx = tracker.subscribe("run-1");
        tracker.start_run("run-1", 10, 0);
        tracker.record_batch("run-1", 10, 0);
        tracker.finish_run("run-1", RunStatus::Completed);

        assert!(tracker.snapshot("run-1").is_none());
        assert!(!tracker.is_tracked("run-1"));
        let mut last = None;
        while let Ok(snapshot) = rx.recv().await {
            last = Some(snapshot);
        }
        assert_eq!(last.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_subscribe_to_unknown_run_does_not_track_it() {
        let tracker = ProgressTracker::new(settings(0));
        let mut rx = tracker.subscribe("nobody");
        assert!(!tracker.is_tracked("nobody"));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_release_drops_run() {
        let tracker = ProgressTracker::new(settings(0));
        tracker.start_run("run-1", 10, 0);
        tracker.release("run-1");
        assert!(tracker.snapshot("run-1").is_none());
    }

    #[test]
    fn test_high_failure_rate_alert() {
        let tracker = ProgressTracker::new(settings(0));
        tracker.start_run("run-1", 100, 0);
        tracker.record_batch("run-1", 10, 2);
        let snapshot = tracker.snapshot("run-1").unwrap();
        assert_eq!(snapshot.alerts.len(), 1);
        assert_eq!(snapshot.alerts[0].kind, AlertKind::HighFailureRate);
    }

    #[test]
    fn test_low_throughput_alert_after_warmup() {
        let mut s = settings(0);
        s.warmup = Duration::ZERO;
        s.low_throughput_threshold = 1_000_000_000.0;
        let tracker = ProgressTracker::new(s);
        tracker.start_run("run-1", 100, 0);
        tracker.record_batch("run-1", 1, 0);
        let snapshot = tracker.snapshot("run-1").unwrap();
        assert!(snapshot
            .alerts
            .iter()
            .any(|a| a.kind == AlertKind::LowThroughput));
    }

    #[test]
    fn test_resume_baseline_counts_toward_percent() {
        let tracker = ProgressTracker::new(settings(0));
        tracker.start_run("run-1", 100, 40);
        tracker.record_batch("run-1", 10, 0);
        let snapshot = tracker.snapshot("run-1").unwrap();
        assert_eq!(snapshot.records_processed, 50);
        assert_eq!(snapshot.percent_complete, 50.0);
    }
}
