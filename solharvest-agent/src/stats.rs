//! Run statistics exposed to external collaborators (dashboard, smoke tests)
//!
//! Cheap cloneable handle over shared counters, mutated by the scheduler
//! and the writer, read as an immutable snapshot by everyone else.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::model::{FetchOutcome, SourceKind};

/// Pipeline stage a source loop is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Idle,
    Collecting,
    Normalizing,
    Writing,
    Sleeping,
}

/// Counters for one source kind.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub quota_skipped: u64,
    pub cache_hits: u64,
    pub points_enqueued: u64,
    pub points_dropped: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub phase: LoopPhase,
}

impl Default for SourceStats {
    fn default() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            failed: 0,
            quota_skipped: 0,
            cache_hits: 0,
            points_enqueued: 0,
            points_dropped: 0,
            last_run: None,
            next_run: None,
            phase: LoopPhase::Idle,
        }
    }
}

/// Writer-level counters, shared across all source loops.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub points_written: u64,
    pub points_spilled: u64,
    pub out_of_order: u64,
    pub flush_failures: u64,
}

/// Read-only view handed to collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub run_id: String,
    pub uptime_seconds: u64,
    pub sources: HashMap<SourceKind, SourceStats>,
    pub writer: WriterStats,
}

#[derive(Default)]
struct StatsInner {
    sources: HashMap<SourceKind, SourceStats>,
    writer: WriterStats,
}

#[derive(Clone)]
pub struct StatsTracker {
    run_id: String,
    start_time: Instant,
    inner: Arc<parking_lot::RwLock<StatsInner>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            inner: Arc::new(parking_lot::RwLock::new(StatsInner::default())),
        }
    }

    /// Record the outcome of one collection attempt.
    pub fn record_outcome(&self, kind: SourceKind, outcome: &FetchOutcome) {
        let mut inner = self.inner.write();
        let stats = inner.sources.entry(kind).or_default();
        stats.attempted += 1;
        match outcome {
            FetchOutcome::Fetched => stats.succeeded += 1,
            FetchOutcome::CacheHit => {
                stats.succeeded += 1;
                stats.cache_hits += 1;
            }
            // Planned skips, recorded distinctly from failures.
            FetchOutcome::CacheStale | FetchOutcome::QuotaSkipped => stats.quota_skipped += 1,
            FetchOutcome::Failed(_) => stats.failed += 1,
        }
    }

    pub fn record_points(&self, kind: SourceKind, enqueued: u64, dropped: u64) {
        let mut inner = self.inner.write();
        let stats = inner.sources.entry(kind).or_default();
        stats.points_enqueued += enqueued;
        stats.points_dropped += dropped;
    }

    pub fn set_phase(&self, kind: SourceKind, phase: LoopPhase) {
        let mut inner = self.inner.write();
        inner.sources.entry(kind).or_default().phase = phase;
    }

    pub fn record_run_times(
        &self,
        kind: SourceKind,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write();
        let stats = inner.sources.entry(kind).or_default();
        stats.last_run = Some(last_run);
        stats.next_run = Some(next_run);
    }

    pub fn record_written(&self, count: u64) {
        self.inner.write().writer.points_written += count;
    }

    pub fn record_spilled(&self, count: u64) {
        self.inner.write().writer.points_spilled += count;
    }

    pub fn record_out_of_order(&self, count: u64) {
        self.inner.write().writer.out_of_order += count;
    }

    pub fn record_flush_failure(&self) {
        self.inner.write().writer.flush_failures += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        StatsSnapshot {
            run_id: self.run_id.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            sources: inner.sources.clone(),
            writer: inner.writer.clone(),
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_bucketed_by_kind() {
        let tracker = StatsTracker::new();

        tracker.record_outcome(SourceKind::Api, &FetchOutcome::Fetched);
        tracker.record_outcome(SourceKind::Api, &FetchOutcome::CacheHit);
        tracker.record_outcome(SourceKind::Api, &FetchOutcome::QuotaSkipped);
        tracker.record_outcome(SourceKind::Modbus, &FetchOutcome::Failed("timeout".into()));

        let snap = tracker.snapshot();
        let api = &snap.sources[&SourceKind::Api];
        assert_eq!(api.attempted, 3);
        assert_eq!(api.succeeded, 2);
        assert_eq!(api.cache_hits, 1);
        assert_eq!(api.quota_skipped, 1);
        assert_eq!(api.failed, 0);

        let modbus = &snap.sources[&SourceKind::Modbus];
        assert_eq!(modbus.attempted, 1);
        assert_eq!(modbus.failed, 1);
    }

    #[test]
    fn test_quota_skip_is_not_a_failure() {
        let tracker = StatsTracker::new();
        tracker.record_outcome(SourceKind::Api, &FetchOutcome::CacheStale);
        let snap = tracker.snapshot();
        let api = &snap.sources[&SourceKind::Api];
        assert_eq!(api.quota_skipped, 1);
        assert_eq!(api.failed, 0);
    }

    #[test]
    fn test_snapshot_is_detached_from_tracker() {
        let tracker = StatsTracker::new();
        tracker.record_written(10);
        let snap = tracker.snapshot();
        tracker.record_written(5);
        assert_eq!(snap.writer.points_written, 10);
    }
}
