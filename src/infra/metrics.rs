//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use them for coordination or access decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// How a door command ended, for counter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcomeKind {
    /// State changed (or status read) successfully
    Applied,
    /// Rejected before reaching the door (validation, not found, unknown action)
    Rejected,
    /// Reached the door and failed (inactive, hardware, persistence, timeout)
    Failed,
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Door commands received (monotonic)
    commands_total: AtomicU64,
    commands_applied: AtomicU64,
    commands_rejected: AtomicU64,
    commands_failed: AtomicU64,
    /// Commands since last report (reset on report)
    commands_since_report: AtomicU64,
    /// Sum of command latencies in microseconds (reset on report)
    command_latency_sum_us: AtomicU64,
    /// Max command latency in microseconds (reset on report)
    command_latency_max_us: AtomicU64,
    /// Command latency histogram buckets (reset on report)
    command_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Tenant status queries served (monotonic)
    status_checks_total: AtomicU64,
    attempts_granted: AtomicU64,
    attempts_denied: AtomicU64,
    /// Audit entries that could not be written (monotonic)
    audit_write_failures: AtomicU64,
    /// Access events that could not be written (monotonic)
    event_write_failures: AtomicU64,
    /// Door version conflicts observed on compare-and-swap (monotonic)
    cas_conflicts: AtomicU64,
    timeouts: AtomicU64,
    /// Feed messages dropped due to channel full (monotonic)
    feed_dropped: AtomicU64,
    relocks_scheduled: AtomicU64,
    relocks_applied: AtomicU64,
    /// Re-locks skipped because the door left temp_unlocked first
    relocks_skipped: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            commands_total: AtomicU64::new(0),
            commands_applied: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_since_report: AtomicU64::new(0),
            command_latency_sum_us: AtomicU64::new(0),
            command_latency_max_us: AtomicU64::new(0),
            command_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            status_checks_total: AtomicU64::new(0),
            attempts_granted: AtomicU64::new(0),
            attempts_denied: AtomicU64::new(0),
            audit_write_failures: AtomicU64::new(0),
            event_write_failures: AtomicU64::new(0),
            cas_conflicts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            feed_dropped: AtomicU64::new(0),
            relocks_scheduled: AtomicU64::new(0),
            relocks_applied: AtomicU64::new(0),
            relocks_skipped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a finished door command with its end-to-end latency (lock-free)
    #[inline]
    pub fn record_command(&self, outcome: CommandOutcomeKind, latency_us: u64) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        self.commands_since_report.fetch_add(1, Ordering::Relaxed);
        self.command_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let counter = match outcome {
            CommandOutcomeKind::Applied => &self.commands_applied,
            CommandOutcomeKind::Rejected => &self.commands_rejected,
            CommandOutcomeKind::Failed => &self.commands_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.command_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.command_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_status_check(&self) {
        self.status_checks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_access_attempt(&self, granted: bool) {
        if granted {
            self.attempts_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.attempts_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_audit_write_failure(&self) {
        self.audit_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_write_failure(&self) {
        self.event_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cas_conflict(&self) {
        self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_feed_dropped(&self) {
        self.feed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_relock_scheduled(&self) {
        self.relocks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_relock(&self, applied: bool) {
        if applied {
            self.relocks_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.relocks_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn commands_total(&self) -> u64 {
        self.commands_total.load(Ordering::Relaxed)
    }

    pub fn audit_write_failures(&self) -> u64 {
        self.audit_write_failures.load(Ordering::Relaxed)
    }

    pub fn cas_conflicts(&self) -> u64 {
        self.cas_conflicts.load(Ordering::Relaxed)
    }

    pub fn feed_dropped(&self) -> u64 {
        self.feed_dropped.load(Ordering::Relaxed)
    }

    /// Generate a metrics summary and reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let command_count = self.commands_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.command_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.command_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.command_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let commands_per_sec = if elapsed.as_secs_f64() > 0.0 {
            command_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if command_count > 0 { latency_sum / command_count } else { 0 };

        MetricsSummary {
            commands_total: self.commands_total.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_per_sec,
            avg_command_latency_us: avg_latency,
            max_command_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            status_checks_total: self.status_checks_total.load(Ordering::Relaxed),
            attempts_granted: self.attempts_granted.load(Ordering::Relaxed),
            attempts_denied: self.attempts_denied.load(Ordering::Relaxed),
            audit_write_failures: self.audit_write_failures.load(Ordering::Relaxed),
            event_write_failures: self.event_write_failures.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            feed_dropped: self.feed_dropped.load(Ordering::Relaxed),
            relocks_scheduled: self.relocks_scheduled.load(Ordering::Relaxed),
            relocks_applied: self.relocks_applied.load(Ordering::Relaxed),
            relocks_skipped: self.relocks_skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub commands_total: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub commands_failed: u64,
    pub commands_per_sec: f64,
    pub avg_command_latency_us: u64,
    pub max_command_latency_us: u64,
    /// Command latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub status_checks_total: u64,
    pub attempts_granted: u64,
    pub attempts_denied: u64,
    pub audit_write_failures: u64,
    pub event_write_failures: u64,
    pub cas_conflicts: u64,
    pub timeouts: u64,
    pub feed_dropped: u64,
    pub relocks_scheduled: u64,
    pub relocks_applied: u64,
    pub relocks_skipped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            commands_total = %self.commands_total,
            commands_per_sec = format!("{:.1}", self.commands_per_sec),
            applied = %self.commands_applied,
            rejected = %self.commands_rejected,
            failed = %self.commands_failed,
            avg_latency_us = %self.avg_command_latency_us,
            p99_us = %self.lat_p99_us,
            status_checks = %self.status_checks_total,
            audit_failures = %self.audit_write_failures,
            cas_conflicts = %self.cas_conflicts,
            "metrics"
        );
    }
}
