//! Domain models - core access-control types
//!
//! This module contains the canonical data types used throughout the engine:
//! - `Door` / `DoorStatus` - controlled doors and their persisted state
//! - `AccessEvent` / `AuditLogEntry` - immutable trail records
//! - `Tenant` / `Lease` / `AccessStatus` - tenancy inputs and derived eligibility
//! - `CommandRequest` / `StatusRequest` / `AttemptRequest` - validated requests
//! - `EngineError` - error taxonomy with HTTP mapping

pub mod command;
pub mod door;
pub mod error;
pub mod event;
pub mod tenant;

// Re-export commonly used types at module level
pub use command::{AttemptRequest, CommandRequest, DoorCommand, StatusRequest};
pub use door::{AccessMethod, Door, DoorStatus, DoorType};
pub use error::{EngineError, EngineResult};
pub use event::{AccessEvent, AccessEventType, AccessResult, AuditLogEntry};
pub use tenant::{AccessStatus, AccessStatusKind, Lease, LeaseStatus, Tenant, TenantLeaseStatus};
