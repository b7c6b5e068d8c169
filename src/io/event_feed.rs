//! Typed channel for the outbound event feed
//!
//! Access events, audit entries and periodic metrics snapshots are offered to a
//! downstream consumer without blocking the request path. The channel is
//! bounded; when it is full the message is dropped and counted.

use crate::domain::event::{AccessEvent, AuditLogEntry};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages carried by the feed, tagged by `kind` on the wire
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Access event as persisted
    AccessEvent(AccessEventPayload),
    /// Audit entry as persisted
    Audit(AuditPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

impl FeedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedMessage::AccessEvent(_) => "access_event",
            FeedMessage::Audit(_) => "audit",
            FeedMessage::Metrics(_) => "metrics",
        }
    }

    /// Single-line JSON form
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Serialize)]
pub struct AccessEventPayload {
    pub site: String,
    #[serde(flatten)]
    pub event: AccessEvent,
}

#[derive(Debug, Serialize)]
pub struct AuditPayload {
    pub site: String,
    #[serde(flatten)]
    pub entry: AuditLogEntry,
}

#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub site: String,
    pub ts: DateTime<Utc>,
    pub commands_total: u64,
    pub commands_failed: u64,
    pub commands_per_sec: f64,
    /// Average command latency (µs)
    pub avg_latency_us: u64,
    /// Max command latency (µs)
    pub max_latency_us: u64,
    /// Command latency histogram buckets
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
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
}

impl MetricsPayload {
    pub fn from_summary(summary: &MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: Utc::now(),
            commands_total: summary.commands_total,
            commands_failed: summary.commands_failed,
            commands_per_sec: summary.commands_per_sec,
            avg_latency_us: summary.avg_command_latency_us,
            max_latency_us: summary.max_command_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p95_us: summary.lat_p95_us,
            lat_p99_us: summary.lat_p99_us,
            status_checks_total: summary.status_checks_total,
            attempts_granted: summary.attempts_granted,
            attempts_denied: summary.attempts_denied,
            audit_write_failures: summary.audit_write_failures,
            event_write_failures: summary.event_write_failures,
            cas_conflicts: summary.cas_conflicts,
            timeouts: summary.timeouts,
            feed_dropped: summary.feed_dropped,
        }
    }
}

/// Sender handle for feed messages
///
/// Clone this to share across producers. Never blocks.
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<FeedMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl FeedSender {
    pub fn new(tx: mpsc::Sender<FeedMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    pub fn send_event(&self, event: &AccessEvent) {
        self.offer(FeedMessage::AccessEvent(AccessEventPayload {
            site: self.site_id.clone(),
            event: event.clone(),
        }));
    }

    pub fn send_audit(&self, entry: &AuditLogEntry) {
        self.offer(FeedMessage::Audit(AuditPayload {
            site: self.site_id.clone(),
            entry: entry.clone(),
        }));
    }

    pub fn send_metrics(&self, summary: &MetricsSummary) {
        self.offer(FeedMessage::Metrics(MetricsPayload::from_summary(
            summary,
            self.site_id.clone(),
        )));
    }

    fn offer(&self, message: FeedMessage) {
        if let Err(e) = self.tx.try_send(message) {
            self.metrics.record_feed_dropped();
            let kind = match &e {
                mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m) => {
                    m.kind()
                }
            };
            debug!(kind = %kind, "feed_message_dropped");
        }
    }
}

/// Create a feed channel pair. The sender can be cloned and shared.
pub fn create_event_feed(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (FeedSender, mpsc::Receiver<FeedMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (FeedSender::new(tx, site_id, metrics), rx)
}
