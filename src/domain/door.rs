//! Door model and door status values

use serde::{Deserialize, Serialize};

/// Persisted door status
///
/// There is no default: a door's state is whatever its stored record says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorStatus {
    Locked,
    Unlocked,
    TempUnlocked,
    EmergencyUnlocked,
    Offline,
}

impl DoorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorStatus::Locked => "locked",
            DoorStatus::Unlocked => "unlocked",
            DoorStatus::TempUnlocked => "temp_unlocked",
            DoorStatus::EmergencyUnlocked => "emergency_unlocked",
            DoorStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for DoorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorType {
    #[default]
    Entry,
    Emergency,
    Interior,
    /// Any type label this engine has no rules for. Door commands only write
    /// the status field, so the stored label survives.
    #[serde(other)]
    Other,
}

impl DoorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorType::Entry => "entry",
            DoorType::Emergency => "emergency",
            DoorType::Interior => "interior",
            DoorType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMethod {
    #[default]
    Keycard,
    Pin,
    Remote,
}

/// A controlled door as stored in the `doors` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Door {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub door_type: DoorType,
    #[serde(default)]
    pub access_method: AccessMethod,
    /// Hardware enabled flag
    pub is_active: bool,
    pub status: DoorStatus,
}

impl Door {
    /// Copy of this door with a new status. The original record is left untouched.
    pub fn with_status(&self, status: DoorStatus) -> Self {
        Self { status, ..self.clone() }
    }
}
