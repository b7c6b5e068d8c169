//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `engine` - Request orchestration, deadlines and partial-failure warnings
//! - `door_machine` - Door command validation and serialized state changes
//! - `lease_evaluator` - Tenant access status from lease records
//! - `aggregator` - Access statistics and alert rules
//! - `event_store` / `audit_logger` - Append-only trail persistence
//! - `directory` - Tenant and lease lookup
//! - `hardware` - Door controller port
//! - `relock_worker` - Timer that re-locks temporarily unlocked doors

pub mod aggregator;
pub mod audit_logger;
pub mod directory;
pub mod door_machine;
pub mod engine;
pub mod event_store;
pub mod hardware;
pub mod lease_evaluator;
pub mod relock_worker;

// Re-export commonly used types
pub use audit_logger::AuditLogger;
pub use directory::{StoreDirectory, TenantDirectory};
pub use door_machine::DoorStateMachine;
pub use engine::{AccessControlEngine, EngineSettings, Reply};
pub use event_store::EventStore;
pub use hardware::{DoorHardware, HardwareError, SimulatedController};
pub use relock_worker::{create_relock_worker, schedule_relock, RelockCmd, RelockWorker};
