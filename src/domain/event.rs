//! Access events and audit log entries
//!
//! Both are value objects: built once, persisted once, never updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessEventType {
    ManualLock,
    ManualUnlock,
    TemporaryUnlock,
    EmergencyUnlock,
    AccessAttempt,
    ControlFailure,
}

impl AccessEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessEventType::ManualLock => "manual_lock",
            AccessEventType::ManualUnlock => "manual_unlock",
            AccessEventType::TemporaryUnlock => "temporary_unlock",
            AccessEventType::EmergencyUnlock => "emergency_unlock",
            AccessEventType::AccessAttempt => "access_attempt",
            AccessEventType::ControlFailure => "control_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessResult {
    Granted,
    Denied,
    Error,
}

impl AccessResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessResult::Granted => "granted",
            AccessResult::Denied => "denied",
            AccessResult::Error => "error",
        }
    }
}

/// Record of one door command outcome or one physical access attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: String,
    pub door_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub event_type: AccessEventType,
    pub result: AccessResult,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
}

impl AccessEvent {
    pub fn new(
        door_id: &str,
        event_type: AccessEventType,
        result: AccessResult,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_record_id(),
            door_id: door_id.to_string(),
            tenant_id: None,
            event_type,
            result,
            timestamp,
            notes: String::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<&str>) -> Self {
        self.tenant_id = tenant_id.map(str::to_string);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// One compliance trail entry per mutating engine call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub details: String,
    pub timestamp: DateTime<Utc>,
    /// Id of the access event this entry pairs with, if any
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl AuditLogEntry {
    pub fn new(
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_record_id(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details: details.into(),
            timestamp,
            correlation_id: None,
        }
    }

    /// Audit entry paired with an access event: same timestamp, correlated id
    pub fn for_event(action: &str, event: &AccessEvent, details: impl Into<String>) -> Self {
        let mut entry = Self::new(action, "door", &event.door_id, details, event.timestamp);
        entry.correlation_id = Some(event.id.clone());
        entry
    }
}
