//! Access statistics and alert rules over historical access events
//!
//! Statistics always cover the whole window. Only the "recent events" list is
//! capped for display.

use crate::domain::event::{AccessEvent, AccessEventType, AccessResult};
use crate::domain::tenant::AccessStatusKind;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Minimum attempts before the denied-ratio warning can fire
const DENIED_WARNING_MIN_ATTEMPTS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoorStatistics {
    pub door_id: String,
    pub total: u64,
    pub granted: u64,
    pub denied: u64,
    pub last_access: Option<DateTime<Utc>>,
}

impl DoorStatistics {
    fn new(door_id: &str) -> Self {
        Self { door_id: door_id.to_string(), total: 0, granted: 0, denied: 0, last_access: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessStatistics {
    pub total_access_attempts: u64,
    pub successful_access: u64,
    pub denied_access: u64,
    pub emergency_access: u64,
    /// Whole percent of granted events, 0 when there are none
    pub success_rate: u64,
    /// Per-door breakdown ordered by door id
    pub by_door: Vec<DoorStatistics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Start of the statistics window ending at `now`
pub fn window_start(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    now - Duration::days(window_days)
}

/// Compute statistics over every event at or after `since`
pub fn aggregate(events: &[AccessEvent], since: DateTime<Utc>) -> AccessStatistics {
    let mut total = 0u64;
    let mut granted = 0u64;
    let mut denied = 0u64;
    let mut emergency = 0u64;
    let mut per_door: FxHashMap<&str, DoorStatistics> = FxHashMap::default();

    for event in events.iter().filter(|e| e.timestamp >= since) {
        total += 1;
        let door = per_door
            .entry(event.door_id.as_str())
            .or_insert_with(|| DoorStatistics::new(&event.door_id));
        door.total += 1;

        match event.result {
            AccessResult::Granted => {
                granted += 1;
                door.granted += 1;
            }
            AccessResult::Denied => {
                denied += 1;
                door.denied += 1;
            }
            AccessResult::Error => {}
        }

        if event.event_type == AccessEventType::EmergencyUnlock {
            emergency += 1;
        }

        if door.last_access.map_or(true, |last| event.timestamp > last) {
            door.last_access = Some(event.timestamp);
        }
    }

    let mut by_door: Vec<DoorStatistics> = per_door.into_values().collect();
    by_door.sort_by(|a, b| a.door_id.cmp(&b.door_id));

    AccessStatistics {
        total_access_attempts: total,
        successful_access: granted,
        denied_access: denied,
        emergency_access: emergency,
        success_rate: success_rate(granted, total),
        by_door,
    }
}

fn success_rate(successful: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (successful as f64 / total as f64 * 100.0).round() as u64
}

/// Evaluate every alert rule independently; all that match are reported
pub fn alerts(stats: &AccessStatistics, lease_status: Option<AccessStatusKind>) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if stats.denied_access > stats.successful_access
        && stats.total_access_attempts > DENIED_WARNING_MIN_ATTEMPTS
    {
        alerts.push(Alert {
            severity: AlertSeverity::Warning,
            message: "High number of denied access attempts".to_string(),
            count: Some(stats.denied_access),
            context: None,
        });
    }

    if lease_status == Some(AccessStatusKind::Expired) {
        alerts.push(Alert {
            severity: AlertSeverity::Error,
            message: "Lease has expired — access should be revoked".to_string(),
            count: None,
            context: Some("lease_expired".to_string()),
        });
    }

    if stats.emergency_access > 0 {
        alerts.push(Alert {
            severity: AlertSeverity::Info,
            message: "Emergency access events recorded".to_string(),
            count: Some(stats.emergency_access),
            context: None,
        });
    }

    alerts
}

/// Most recent events in the window, newest first, capped at `limit`
pub fn recent_events(events: &[AccessEvent], since: DateTime<Utc>, limit: usize) -> Vec<AccessEvent> {
    let mut recent: Vec<AccessEvent> =
        events.iter().filter(|e| e.timestamp >= since).cloned().collect();
    recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
    recent.truncate(limit);
    recent
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
    }

    fn event(door: &str, kind: AccessEventType, result: AccessResult, mins_ago: i64) -> AccessEvent {
        AccessEvent::new(door, kind, result, now() - Duration::minutes(mins_ago))
            .with_tenant(Some("T1"))
    }

    fn attempts(granted: usize, denied: usize) -> Vec<AccessEvent> {
        let mut events = Vec::new();
        for i in 0..granted {
            events.push(event("D1", AccessEventType::AccessAttempt, AccessResult::Granted, i as i64));
        }
        for i in 0..denied {
            events.push(event("D2", AccessEventType::AccessAttempt, AccessResult::Denied, i as i64));
        }
        events
    }

    fn since() -> DateTime<Utc> {
        window_start(now(), 30)
    }

    #[test]
    fn test_mostly_denied_fires_warning() {
        let stats = aggregate(&attempts(2, 6), since());

        assert_eq!(stats.total_access_attempts, 8);
        assert_eq!(stats.successful_access, 2);
        assert_eq!(stats.denied_access, 6);
        assert_eq!(stats.success_rate, 25);

        let alerts = alerts(&stats, Some(AccessStatusKind::Active));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[0].message, "High number of denied access attempts");
        assert_eq!(alerts[0].count, Some(6));
    }

    #[test]
    fn test_mostly_granted_no_warning() {
        let stats = aggregate(&attempts(10, 3), since());
        assert_eq!(stats.total_access_attempts, 13);
        assert_eq!(stats.success_rate, 77);
        assert!(alerts(&stats, Some(AccessStatusKind::Active)).is_empty());
    }

    #[test]
    fn test_warning_needs_more_than_five_attempts() {
        let stats = aggregate(&attempts(0, 5), since());
        assert!(alerts(&stats, None).is_empty());
    }

    #[test]
    fn test_empty_window() {
        let stats = aggregate(&[], since());
        assert_eq!(stats.total_access_attempts, 0);
        assert_eq!(stats.success_rate, 0);
        assert!(stats.by_door.is_empty());
        assert!(alerts(&stats, None).is_empty());
    }

    #[test]
    fn test_all_rules_fire_together() {
        let mut events = attempts(1, 6);
        events.push(event("D3", AccessEventType::EmergencyUnlock, AccessResult::Granted, 3));
        let stats = aggregate(&events, since());
        assert_eq!(stats.emergency_access, 1);

        let alerts = alerts(&stats, Some(AccessStatusKind::Expired));
        let severities: Vec<AlertSeverity> = alerts.iter().map(|a| a.severity).collect();
        assert_eq!(
            severities,
            vec![AlertSeverity::Warning, AlertSeverity::Error, AlertSeverity::Info]
        );
        assert_eq!(alerts[1].message, "Lease has expired — access should be revoked");
    }

    #[test]
    fn test_errors_count_toward_total_only() {
        let events = vec![
            event("D1", AccessEventType::ManualUnlock, AccessResult::Error, 1),
            event("D1", AccessEventType::ManualUnlock, AccessResult::Granted, 2),
        ];
        let stats = aggregate(&events, since());
        assert_eq!(stats.total_access_attempts, 2);
        assert_eq!(stats.successful_access, 1);
        assert_eq!(stats.denied_access, 0);
        assert_eq!(stats.success_rate, 50);
    }

    #[test]
    fn test_per_door_breakdown() {
        let events = vec![
            event("D2", AccessEventType::AccessAttempt, AccessResult::Denied, 10),
            event("D1", AccessEventType::AccessAttempt, AccessResult::Granted, 30),
            event("D1", AccessEventType::AccessAttempt, AccessResult::Granted, 5),
            event("D1", AccessEventType::AccessAttempt, AccessResult::Denied, 20),
        ];
        let stats = aggregate(&events, since());

        assert_eq!(stats.by_door.len(), 2);
        let d1 = &stats.by_door[0];
        assert_eq!(d1.door_id, "D1");
        assert_eq!((d1.total, d1.granted, d1.denied), (3, 2, 1));
        assert_eq!(d1.last_access, Some(now() - Duration::minutes(5)));
        assert_eq!(stats.by_door[1].door_id, "D2");
    }

    #[test]
    fn test_events_outside_window_ignored() {
        let mut events = attempts(1, 0);
        events.push(event("D1", AccessEventType::AccessAttempt, AccessResult::Denied, 60 * 24 * 31));
        let stats = aggregate(&events, since());
        assert_eq!(stats.total_access_attempts, 1);
    }

    #[test]
    fn test_order_independent() {
        let mut events = attempts(4, 7);
        let forward = aggregate(&events, since());
        events.reverse();
        assert_eq!(aggregate(&events, since()), forward);
    }

    #[test]
    fn test_recent_events_capped_but_stats_full() {
        let events = attempts(60, 0);
        let recent = recent_events(&events, since(), 50);
        assert_eq!(recent.len(), 50);
        assert!(recent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(aggregate(&events, since()).total_access_attempts, 60);
    }
}
