//! Tenant and lease records (read-only to the engine) and the derived access status

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lease status as maintained on the tenant record by tenant management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantLeaseStatus {
    Active,
    Terminated,
    Pending,
    #[default]
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub lease_status: TenantLeaseStatus,
    #[serde(default)]
    pub move_in_date: Option<NaiveDate>,
    #[serde(default)]
    pub move_out_date: Option<NaiveDate>,
    #[serde(default)]
    pub access_permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Draft,
    Active,
    Expired,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Open-ended lease when absent
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub status: LeaseStatus,
}

/// Access eligibility derived from tenant and lease data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatusKind {
    Active,
    Pending,
    Expired,
    Terminated,
    Inactive,
}

impl AccessStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatusKind::Active => "active",
            AccessStatusKind::Pending => "pending",
            AccessStatusKind::Expired => "expired",
            AccessStatusKind::Terminated => "terminated",
            AccessStatusKind::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStatus {
    pub status: AccessStatusKind,
    pub reason: String,
    pub is_active: bool,
    pub permissions: Vec<String>,
}
