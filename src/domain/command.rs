//! Request payloads, validated at the boundary into typed commands
//!
//! Raw bodies are deserialized into `Raw*` structs with every field optional so
//! that missing fields become `Validation` errors rather than parse failures.
//! Past this module, nothing branches on action strings.

use crate::domain::error::{EngineError, EngineResult};
use serde::Deserialize;

/// Default re-lock hint for `temp_unlock`
pub const DEFAULT_AUTO_LOCK_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorCommand {
    Lock,
    Unlock,
    TempUnlock { auto_lock_seconds: u64 },
    EmergencyUnlock,
    StatusCheck,
}

impl DoorCommand {
    /// Parse an action name. `auto_lock_seconds` only applies to `temp_unlock`.
    pub fn parse(action: &str, auto_lock_seconds: u64) -> EngineResult<Self> {
        match action {
            "lock" => Ok(DoorCommand::Lock),
            "unlock" => Ok(DoorCommand::Unlock),
            "temp_unlock" => Ok(DoorCommand::TempUnlock { auto_lock_seconds }),
            "emergency_unlock" => Ok(DoorCommand::EmergencyUnlock),
            "status_check" => Ok(DoorCommand::StatusCheck),
            other => Err(EngineError::UnknownAction(other.to_string())),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            DoorCommand::Lock => "lock",
            DoorCommand::Unlock => "unlock",
            DoorCommand::TempUnlock { .. } => "temp_unlock",
            DoorCommand::EmergencyUnlock => "emergency_unlock",
            DoorCommand::StatusCheck => "status_check",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, DoorCommand::StatusCheck)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawCommandRequest {
    #[serde(default)]
    pub door_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub auto_lock_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub door_id: String,
    pub command: DoorCommand,
    pub tenant_id: Option<String>,
    pub reason: Option<String>,
}

impl CommandRequest {
    pub fn new(door_id: &str, command: DoorCommand) -> Self {
        Self { door_id: door_id.to_string(), command, tenant_id: None, reason: None }
    }

    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Validate a raw body. Field presence is checked before the action name.
    pub fn from_raw(raw: RawCommandRequest, default_auto_lock_seconds: u64) -> EngineResult<Self> {
        let door_id = required(raw.door_id, "door_id")?;
        let action = required(raw.action, "action")?;
        let auto_lock_seconds = match raw.auto_lock_seconds {
            Some(0) => return Err(EngineError::validation("auto_lock_seconds must be positive")),
            Some(secs) => secs,
            None => default_auto_lock_seconds,
        };
        let command = DoorCommand::parse(action.trim(), auto_lock_seconds)?;

        Ok(Self {
            door_id,
            command,
            tenant_id: non_empty(raw.tenant_id),
            reason: non_empty(raw.reason),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawStatusRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    pub tenant_id: String,
}

impl StatusRequest {
    pub fn new(tenant_id: &str) -> Self {
        Self { tenant_id: tenant_id.to_string() }
    }

    pub fn from_raw(raw: RawStatusRequest) -> EngineResult<Self> {
        Ok(Self { tenant_id: required(raw.tenant_id, "tenant_id")? })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawAttemptRequest {
    #[serde(default)]
    pub door_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// A credential presented at a door reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRequest {
    pub door_id: String,
    pub tenant_id: String,
}

impl AttemptRequest {
    pub fn new(door_id: &str, tenant_id: &str) -> Self {
        Self { door_id: door_id.to_string(), tenant_id: tenant_id.to_string() }
    }

    pub fn from_raw(raw: RawAttemptRequest) -> EngineResult<Self> {
        Ok(Self {
            door_id: required(raw.door_id, "door_id")?,
            tenant_id: required(raw.tenant_id, "tenant_id")?,
        })
    }
}

fn required(value: Option<String>, field: &str) -> EngineResult<String> {
    non_empty(value).ok_or_else(|| EngineError::validation(format!("{field} is required")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
