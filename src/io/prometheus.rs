//! Prometheus text exposition for engine metrics
//!
//! Served at GET /metrics by the HTTP API.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter family split by one label
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_command_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);
    write_access_metrics(&mut output, site_id, &summary);
    write_failure_metrics(&mut output, site_id, &summary);
    write_relock_metrics(&mut output, site_id, &summary);

    output
}

fn write_command_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "access_engine_commands_total",
        "Door commands by outcome",
        site,
        "outcome",
        &[
            ("applied", summary.commands_applied),
            ("rejected", summary.commands_rejected),
            ("failed", summary.commands_failed),
        ],
    );
    let _ = writeln!(output, "# HELP access_engine_commands_per_sec Door commands per second");
    let _ = writeln!(output, "# TYPE access_engine_commands_per_sec gauge");
    let _ = writeln!(
        output,
        "access_engine_commands_per_sec{{site=\"{site}\"}} {:.2}",
        summary.commands_per_sec
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "access_engine_command_latency_us",
        "Door command latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_command_latency_us,
    );

    write_metric(
        output,
        "access_engine_command_latency_p50_us",
        "50th percentile command latency",
        MetricType::Gauge,
        site,
        summary.lat_p50_us,
    );
    write_metric(
        output,
        "access_engine_command_latency_p95_us",
        "95th percentile command latency",
        MetricType::Gauge,
        site,
        summary.lat_p95_us,
    );
    write_metric(
        output,
        "access_engine_command_latency_p99_us",
        "99th percentile command latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "access_engine_command_latency_max_us",
        "Maximum command latency",
        MetricType::Gauge,
        site,
        summary.max_command_latency_us,
    );
}

fn write_access_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "access_engine_status_checks_total",
        "Tenant access status reports served",
        MetricType::Counter,
        site,
        summary.status_checks_total,
    );
    write_labeled_counter(
        output,
        "access_engine_access_attempts_total",
        "Credential presentations by result",
        site,
        "result",
        &[("granted", summary.attempts_granted), ("denied", summary.attempts_denied)],
    );
}

fn write_failure_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "access_engine_audit_write_failures_total",
        "Audit entries that could not be persisted",
        MetricType::Counter,
        site,
        summary.audit_write_failures,
    );
    write_metric(
        output,
        "access_engine_event_write_failures_total",
        "Access events that could not be persisted",
        MetricType::Counter,
        site,
        summary.event_write_failures,
    );
    write_metric(
        output,
        "access_engine_version_conflicts_total",
        "Door version conflicts on write",
        MetricType::Counter,
        site,
        summary.cas_conflicts,
    );
    write_metric(
        output,
        "access_engine_timeouts_total",
        "Invocations that exceeded their deadline",
        MetricType::Counter,
        site,
        summary.timeouts,
    );
    write_metric(
        output,
        "access_engine_feed_dropped_total",
        "Feed messages dropped on a full channel",
        MetricType::Counter,
        site,
        summary.feed_dropped,
    );
}

fn write_relock_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "access_engine_relocks_scheduled_total",
        "Re-lock timers started after temporary unlocks",
        MetricType::Counter,
        site,
        summary.relocks_scheduled,
    );
    write_labeled_counter(
        output,
        "access_engine_relocks_total",
        "Re-lock timers fired, by outcome",
        site,
        "outcome",
        &[("applied", summary.relocks_applied), ("skipped", summary.relocks_skipped)],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::CommandOutcomeKind;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_command(CommandOutcomeKind::Applied, 150);
        metrics.record_command(CommandOutcomeKind::Applied, 250);
        metrics.record_command(CommandOutcomeKind::Rejected, 40);
        metrics.record_access_attempt(true);
        metrics.record_access_attempt(false);
        metrics.record_cas_conflict();

        let output = format_prometheus_metrics(&metrics, "tower-a");

        assert!(output
            .contains("access_engine_commands_total{site=\"tower-a\",outcome=\"applied\"} 2"));
        assert!(output
            .contains("access_engine_commands_total{site=\"tower-a\",outcome=\"rejected\"} 1"));
        assert!(output.contains("access_engine_command_latency_us_bucket{site=\"tower-a\""));
        assert!(output.contains("access_engine_command_latency_us_count{site=\"tower-a\"} 3"));
        assert!(output.contains(
            "access_engine_access_attempts_total{site=\"tower-a\",result=\"granted\"} 1"
        ));
        assert!(output.contains("access_engine_version_conflicts_total{site=\"tower-a\"} 1"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let metrics = Metrics::new();
        metrics.record_command(CommandOutcomeKind::Applied, 50);
        metrics.record_command(CommandOutcomeKind::Applied, 100_000);

        let output = format_prometheus_metrics(&metrics, "s");
        assert!(output.contains("access_engine_command_latency_us_bucket{site=\"s\",le=\"100\"} 1"));
        assert!(output.contains("access_engine_command_latency_us_bucket{site=\"s\",le=\"+Inf\"} 2"));
    }
}
