//! Tenant access status derived from lease and tenancy records
//!
//! Pure computation over the inputs supplied by the caller. Dates are compared
//! as UTC calendar days: a lease ending today is still in force, one that
//! ended yesterday is expired.

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::tenant::{
    AccessStatus, AccessStatusKind, Lease, LeaseStatus, Tenant, TenantLeaseStatus,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Access status together with the lease it was derived from
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseEvaluation {
    pub access: AccessStatus,
    pub lease: Option<Lease>,
}

/// Lease summary included in status reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseInfo {
    pub lease_id: String,
    pub property_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: LeaseStatus,
    /// Days until `end_date`, negative once past. None for open-ended leases.
    pub days_remaining: Option<i64>,
}

impl LeaseInfo {
    pub fn from_lease(lease: &Lease, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self {
            lease_id: lease.id.clone(),
            property_id: lease.property_id.clone(),
            start_date: lease.start_date,
            end_date: lease.end_date,
            status: lease.status,
            days_remaining: lease.end_date.map(|end| (end - today).num_days()),
        }
    }
}

/// Compute a tenant's access status. First matching rule wins:
///
/// 1. tenant marked terminated
/// 2. no active lease
/// 3. active lease not started / ended / in force
pub fn evaluate(
    tenant: &Tenant,
    leases: &[Lease],
    now: DateTime<Utc>,
) -> EngineResult<LeaseEvaluation> {
    if tenant.id.trim().is_empty() {
        return Err(EngineError::validation("tenant id is required"));
    }

    let permissions = tenant.access_permissions.clone();
    let status = |kind: AccessStatusKind, reason: &str| AccessStatus {
        status: kind,
        reason: reason.to_string(),
        is_active: kind == AccessStatusKind::Active,
        permissions: permissions.clone(),
    };

    if tenant.lease_status == TenantLeaseStatus::Terminated {
        return Ok(LeaseEvaluation {
            access: status(AccessStatusKind::Terminated, "Lease terminated"),
            lease: None,
        });
    }

    let today = now.date_naive();
    let Some((lease, start)) = select_active_lease(leases, today)? else {
        return Ok(LeaseEvaluation {
            access: status(AccessStatusKind::Inactive, "No active lease"),
            lease: None,
        });
    };

    let access = if today < start {
        status(AccessStatusKind::Pending, "Lease not yet started")
    } else if lease.end_date.is_some_and(|end| today > end) {
        status(AccessStatusKind::Expired, "Lease expired")
    } else {
        status(AccessStatusKind::Active, "Active lease in good standing")
    };

    Ok(LeaseEvaluation { access, lease: Some(lease.clone()) })
}

/// Pick the governing lease among those marked active.
///
/// Prefers a lease whose window contains `today`; otherwise the most recently
/// started one. Ties are broken by lease id so the choice is stable.
fn select_active_lease(leases: &[Lease], today: NaiveDate) -> EngineResult<Option<(&Lease, NaiveDate)>> {
    let mut active = Vec::new();
    for lease in leases.iter().filter(|l| l.status == LeaseStatus::Active) {
        let start = lease.start_date.ok_or_else(|| {
            EngineError::validation(format!("lease `{}` has no start_date", lease.id))
        })?;
        active.push((lease, start));
    }

    let in_force = active
        .iter()
        .filter(|(lease, start)| *start <= today && lease.end_date.map_or(true, |end| end >= today))
        .max_by(|a, b| (a.1, &a.0.id).cmp(&(b.1, &b.0.id)));
    if let Some(found) = in_force {
        return Ok(Some(*found));
    }

    Ok(active.into_iter().max_by(|a, b| (a.1, &a.0.id).cmp(&(b.1, &b.0.id))))
}
