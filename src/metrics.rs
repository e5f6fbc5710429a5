use crate::format_duration;
use metrics::increment_counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Run-wide counters for discovery and uploads.
///
/// Each event is counted locally, so a summary is available without an
/// installed recorder, and is also forwarded to the `metrics` facade.
#[derive(Debug)]
pub struct DiscoveryStats {
    started: Instant,
    snapshots_captured: AtomicU64,
    snapshots_failed: AtomicU64,
    snapshots_aborted: AtomicU64,
    resources_fetched: AtomicU64,
    resources_cached: AtomicU64,
    resources_skipped: AtomicU64,
    requests_denied: AtomicU64,
    uploads_succeeded: AtomicU64,
    uploads_failed: AtomicU64,
}

impl Default for DiscoveryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            snapshots_captured: AtomicU64::new(0),
            snapshots_failed: AtomicU64::new(0),
            snapshots_aborted: AtomicU64::new(0),
            resources_fetched: AtomicU64::new(0),
            resources_cached: AtomicU64::new(0),
            resources_skipped: AtomicU64::new(0),
            requests_denied: AtomicU64::new(0),
            uploads_succeeded: AtomicU64::new(0),
            uploads_failed: AtomicU64::new(0),
        }
    }

    pub fn record_captured(&self) {
        self.snapshots_captured.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_snapshots_captured_total");
    }

    pub fn record_failed(&self) {
        self.snapshots_failed.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_snapshots_failed_total");
    }

    pub fn record_aborted(&self) {
        self.snapshots_aborted.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_snapshots_aborted_total");
    }

    pub fn record_fetched(&self) {
        self.resources_fetched.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_resources_fetched_total");
    }

    pub fn record_cache_hit(&self) {
        self.resources_cached.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_cache_hits_total");
    }

    pub fn record_skipped(&self) {
        self.resources_skipped.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_resources_skipped_total");
    }

    pub fn record_denied(&self) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
        increment_counter!("snapshot_capture_requests_denied_total");
    }

    pub fn record_upload(&self, success: bool) {
        if success {
            self.uploads_succeeded.fetch_add(1, Ordering::Relaxed);
            increment_counter!("snapshot_capture_uploads_total");
        } else {
            self.uploads_failed.fetch_add(1, Ordering::Relaxed);
            increment_counter!("snapshot_capture_upload_failures_total");
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed: self.started.elapsed(),
            snapshots_captured: self.snapshots_captured.load(Ordering::Relaxed),
            snapshots_failed: self.snapshots_failed.load(Ordering::Relaxed),
            snapshots_aborted: self.snapshots_aborted.load(Ordering::Relaxed),
            resources_fetched: self.resources_fetched.load(Ordering::Relaxed),
            resources_cached: self.resources_cached.load(Ordering::Relaxed),
            resources_skipped: self.resources_skipped.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            uploads_succeeded: self.uploads_succeeded.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Time since the run started
    pub elapsed: Duration,
    pub snapshots_captured: u64,
    pub snapshots_failed: u64,
    pub snapshots_aborted: u64,
    pub resources_fetched: u64,
    pub resources_cached: u64,
    pub resources_skipped: u64,
    pub requests_denied: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
}

impl StatsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.resources_fetched + self.resources_cached;
        if lookups == 0 {
            0.0
        } else {
            (self.resources_cached as f64 / lookups as f64) * 100.0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Captured {} snapshot(s) in {}, {} failed, {} aborted",
            self.snapshots_captured,
            format_duration(self.elapsed),
            self.snapshots_failed,
            self.snapshots_aborted
        )
    }

    pub fn log_summary(&self) {
        info!("{}", self.summary());
        info!(
            "Resources: {} fetched, {} from cache ({:.1}%), {} skipped, {} denied",
            self.resources_fetched,
            self.resources_cached,
            self.cache_hit_rate(),
            self.resources_skipped,
            self.requests_denied
        );
        info!(
            "Uploads: {} succeeded, {} failed",
            self.uploads_succeeded, self.uploads_failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = DiscoveryStats::new();
        stats.record_captured();
        stats.record_captured();
        stats.record_failed();
        stats.record_upload(true);
        stats.record_upload(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.snapshots_captured, 2);
        assert_eq!(snapshot.snapshots_failed, 1);
        assert_eq!(snapshot.uploads_succeeded, 1);
        assert_eq!(snapshot.uploads_failed, 1);
    }

    #[test]
    fn test_summary_reports_run_time() {
        let snapshot = StatsSnapshot {
            elapsed: Duration::from_millis(65_000),
            snapshots_captured: 3,
            snapshots_failed: 1,
            ..Default::default()
        };
        assert_eq!(
            snapshot.summary(),
            "Captured 3 snapshot(s) in 1m 5s, 1 failed, 0 aborted"
        );
    }

    #[test]
    fn test_cache_hit_rate() {
        let stats = DiscoveryStats::new();
        assert_eq!(stats.snapshot().cache_hit_rate(), 0.0);

        stats.record_fetched();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_hit();
        assert_eq!(stats.snapshot().cache_hit_rate(), 75.0);
    }
}
