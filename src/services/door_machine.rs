//! Door state machine: validates door commands and applies them
//!
//! Commands for one door are serialized twice over: an in-process async mutex
//! per door id, and a compare-and-swap on the stored door version. The mutex
//! only avoids needless conflicts inside one process; the version check is what
//! keeps concurrent engine instances linearizable. On a conflict the door is
//! re-read and the command re-applied to the fresh state.
//!
//! Order of effects for a mutating command:
//! 1. compare-and-swap the new status into the door record
//! 2. drive the controller (only the writer that won step 1 does this)
//! 3. re-read the door and re-drive the controller if a later command
//!    committed while ours was in flight
//! 4. write the access event
//!
//! If step 2 or 4 fails the door record is put back, unless another command
//! has committed since. The machine writes the door state and the access
//! event. The matching audit entry is returned pending, for the engine to
//! record.

use crate::domain::command::{CommandRequest, DoorCommand};
use crate::domain::door::{Door, DoorStatus};
use crate::domain::error::{EngineError, EngineResult};
use crate::domain::event::{AccessEvent, AccessEventType, AccessResult, AuditLogEntry};
use crate::infra::metrics::Metrics;
use crate::infra::store::{Document, DocumentStore, StoreError, DOORS};
use crate::services::event_store::EventStore;
use crate::services::hardware::DoorHardware;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn};

/// A validated state change, not yet applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub command: DoorCommand,
    pub from: DoorStatus,
    pub to: DoorStatus,
    pub event_type: AccessEventType,
    pub audit_action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Read-only command; nothing is written
    Read,
    Apply(Transition),
}

/// Decide what a command does to a door, without side effects
pub fn plan(door: &Door, command: DoorCommand) -> EngineResult<Plan> {
    let (to, event_type) = match command {
        DoorCommand::StatusCheck => return Ok(Plan::Read),
        DoorCommand::Lock => (DoorStatus::Locked, AccessEventType::ManualLock),
        DoorCommand::Unlock => (DoorStatus::Unlocked, AccessEventType::ManualUnlock),
        DoorCommand::TempUnlock { .. } => (DoorStatus::TempUnlocked, AccessEventType::TemporaryUnlock),
        DoorCommand::EmergencyUnlock => {
            (DoorStatus::EmergencyUnlocked, AccessEventType::EmergencyUnlock)
        }
    };

    // Life-safety override: emergency unlock ignores the hardware enabled flag
    if !door.is_active && command != DoorCommand::EmergencyUnlock {
        return Err(EngineError::DoorInactive { door_id: door.id.clone() });
    }

    Ok(Plan::Apply(Transition {
        command,
        from: door.status,
        to,
        event_type,
        audit_action: audit_action(command),
    }))
}

/// Access event type recorded for a command; None for read-only commands
pub fn event_type_for(command: DoorCommand) -> Option<AccessEventType> {
    match command {
        DoorCommand::Lock => Some(AccessEventType::ManualLock),
        DoorCommand::Unlock => Some(AccessEventType::ManualUnlock),
        DoorCommand::TempUnlock { .. } => Some(AccessEventType::TemporaryUnlock),
        DoorCommand::EmergencyUnlock => Some(AccessEventType::EmergencyUnlock),
        DoorCommand::StatusCheck => None,
    }
}

/// Audit action name for a command
pub fn audit_action(command: DoorCommand) -> &'static str {
    match command {
        DoorCommand::Lock => "door_lock",
        DoorCommand::Unlock => "door_unlock",
        DoorCommand::TempUnlock { .. } => "door_temp_unlock",
        DoorCommand::EmergencyUnlock => "door_emergency_unlock",
        DoorCommand::StatusCheck => "door_status_check",
    }
}

/// Audit action name for a failed command
pub fn failure_audit_action(command: DoorCommand) -> String {
    format!("{}_failed", audit_action(command))
}

pub fn success_message(command: DoorCommand) -> String {
    match command {
        DoorCommand::Lock => "Door locked successfully".to_string(),
        DoorCommand::Unlock => "Door unlocked successfully".to_string(),
        DoorCommand::TempUnlock { auto_lock_seconds } => {
            format!("Door temporarily unlocked for {} seconds", auto_lock_seconds)
        }
        DoorCommand::EmergencyUnlock => "Emergency unlock activated".to_string(),
        DoorCommand::StatusCheck => "Door status retrieved".to_string(),
    }
}

/// Conditional execution: the command only runs while the door is still in
/// `status` at `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precondition {
    pub status: DoorStatus,
    pub version: u64,
}

impl Precondition {
    fn holds(&self, door: &Door, version: u64) -> bool {
        door.status == self.status && version == self.version
    }
}

/// Door body with only the status replaced. Fields the engine does not model
/// are written back untouched.
fn status_patch(body: &Value, status: DoorStatus) -> Value {
    let mut patched = body.clone();
    if let Value::Object(fields) = &mut patched {
        fields.insert("status".to_string(), Value::String(status.as_str().to_string()));
    }
    patched
}

/// Per-door async mutexes, created on first use
#[derive(Default)]
pub struct DoorLocks {
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DoorLocks {
    pub async fn acquire(&self, door_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(door_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone)]
pub struct AppliedTransition {
    /// Door as persisted after the transition
    pub door: Door,
    /// Door version written by the transition
    pub version: u64,
    pub transition: Transition,
    pub event: AccessEvent,
    pub audit: AuditLogEntry,
}

#[derive(Debug, Clone)]
pub struct FailedTransition {
    pub door: Door,
    pub error: EngineError,
    /// The error-result event, if it could be written
    pub event: Option<AccessEvent>,
    pub audit: AuditLogEntry,
}

#[derive(Debug, Clone)]
pub enum Execution {
    /// Read-only command served
    Read(Door),
    /// Precondition on the current status did not hold; nothing was done
    Skipped(Door),
    Applied(AppliedTransition),
    Failed(FailedTransition),
}

pub struct DoorStateMachine {
    store: Arc<dyn DocumentStore>,
    hardware: Arc<dyn DoorHardware>,
    events: EventStore,
    locks: DoorLocks,
    cas_retries: u32,
    metrics: Arc<Metrics>,
}

impl DoorStateMachine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        hardware: Arc<dyn DoorHardware>,
        events: EventStore,
        cas_retries: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, hardware, events, locks: DoorLocks::default(), cas_retries, metrics }
    }

    /// Read a door fresh from the store, with its version
    pub async fn load(&self, door_id: &str) -> EngineResult<(Door, u64)> {
        let (door, doc) = self.load_document(door_id).await?;
        Ok((door, doc.version))
    }

    async fn load_document(&self, door_id: &str) -> EngineResult<(Door, Document)> {
        let doc = self
            .store
            .get(DOORS, door_id)
            .await?
            .ok_or_else(|| EngineError::not_found("door", door_id))?;
        Ok((doc.decode()?, doc))
    }

    /// Run a command against a door.
    ///
    /// `Err` means the command never reached door state (validation, unknown
    /// door, storage read failure) and nothing was recorded. Failures after
    /// that point come back as `Execution::Failed` with their trail.
    ///
    /// With `precondition`, the command only runs if the door is still in that
    /// status at that version.
    pub async fn execute(
        &self,
        request: &CommandRequest,
        now: DateTime<Utc>,
        precondition: Option<Precondition>,
    ) -> EngineResult<Execution> {
        let _guard = if request.command.is_mutating() {
            Some(self.locks.acquire(&request.door_id).await)
        } else {
            None
        };

        let mut conflicts = 0;
        loop {
            let (door, doc) = self.load_document(&request.door_id).await?;

            if precondition.is_some_and(|p| !p.holds(&door, doc.version)) {
                debug!(
                    door_id = %door.id,
                    status = %door.status,
                    version = %doc.version,
                    "door_command_precondition_failed"
                );
                return Ok(Execution::Skipped(door));
            }

            let transition = match plan(&door, request.command) {
                Ok(Plan::Read) => return Ok(Execution::Read(door)),
                Ok(Plan::Apply(transition)) => transition,
                Err(e @ EngineError::DoorInactive { .. }) => {
                    let event_type = event_type_for(request.command)
                        .unwrap_or(AccessEventType::ControlFailure);
                    return Ok(Execution::Failed(
                        self.record_failure(door, request, event_type, e, now).await,
                    ));
                }
                Err(e) => return Err(e),
            };

            let write = self
                .store
                .update(DOORS, &door.id, status_patch(&doc.data, transition.to), Some(doc.version))
                .await;
            let committed = match write {
                Ok(committed) => committed,
                Err(StoreError::VersionConflict { actual, .. }) if conflicts < self.cas_retries => {
                    conflicts += 1;
                    self.metrics.record_cas_conflict();
                    warn!(
                        door_id = %door.id,
                        expected_version = %doc.version,
                        actual_version = %actual,
                        retry = %conflicts,
                        "door_version_conflict"
                    );
                    continue;
                }
                Err(e) => {
                    if matches!(e, StoreError::VersionConflict { .. }) {
                        self.metrics.record_cas_conflict();
                    }
                    let event_type = transition.event_type;
                    return Ok(Execution::Failed(
                        self.record_failure(door, request, event_type, e.into(), now).await,
                    ));
                }
            };
            let updated = door.with_status(transition.to);

            if let Err(e) = self.hardware.apply(&updated, transition.to).await {
                // Controller never acknowledged, so only the record moves back
                self.revert(&door, &doc.data, committed.version, false).await;
                return Ok(Execution::Failed(
                    self.record_failure(
                        door,
                        request,
                        AccessEventType::ControlFailure,
                        EngineError::Hardware(e.to_string()),
                        now,
                    )
                    .await,
                ));
            }
            self.reconcile(&door.id, transition.to, committed.version).await;

            let notes = request.reason.clone().unwrap_or_else(|| success_message(request.command));
            let event = AccessEvent::new(&door.id, transition.event_type, AccessResult::Granted, now)
                .with_tenant(request.tenant_id.as_deref())
                .with_notes(notes);

            if let Err(e) = self.events.append(&event).await {
                self.metrics.record_event_write_failure();
                error!(door_id = %door.id, error = %e, "access_event_write_failed");
                self.revert(&door, &doc.data, committed.version, true).await;
                return Ok(Execution::Failed(
                    self.record_failure(door, request, transition.event_type, e, now).await,
                ));
            }

            let details = format!(
                "{} door {} ({}) {} -> {}{}",
                request.command.action(),
                door.name,
                door.id,
                transition.from,
                transition.to,
                request.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
            );
            let audit = AuditLogEntry::for_event(transition.audit_action, &event, details);

            return Ok(Execution::Applied(AppliedTransition {
                door: updated,
                version: committed.version,
                transition,
                event,
                audit,
            }));
        }
    }

    /// Put a door record back to its body before a failed command. Skipped when
    /// another command has committed since: that command owns the door now.
    /// With `redrive`, the controller is driven back as well.
    async fn revert(&self, original: &Door, body: &Value, committed_version: u64, redrive: bool) {
        match self.store.update(DOORS, &original.id, body.clone(), Some(committed_version)).await {
            Ok(_) => {
                warn!(door_id = %original.id, status = %original.status, "door_state_reverted");
                if redrive {
                    if let Err(e) = self.hardware.apply(original, original.status).await {
                        error!(
                            door_id = %original.id,
                            target = %original.status,
                            error = %e,
                            "door_revert_drive_failed"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(door_id = %original.id, error = %e, "door_state_revert_skipped");
            }
        }
    }

    /// Leave the controller in the latest committed status. Another engine
    /// instance may have committed after us and driven the controller before
    /// our acknowledgement came back.
    async fn reconcile(&self, door_id: &str, mut driven: DoorStatus, mut seen_version: u64) {
        for _ in 0..=self.cas_retries {
            let (current, version) = match self.load(door_id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(door_id = %door_id, error = %e, "door_reconcile_failed");
                    return;
                }
            };
            if version == seen_version || current.status == driven {
                return;
            }

            warn!(
                door_id = %door_id,
                driven = %driven,
                committed = %current.status,
                version = %version,
                "door_controller_resync"
            );
            if let Err(e) = self.hardware.apply(&current, current.status).await {
                error!(door_id = %door_id, target = %current.status, error = %e, "door_resync_failed");
                return;
            }
            driven = current.status;
            seen_version = version;
        }
    }

    /// Record the error-result event for a failed command and prepare its audit entry
    async fn record_failure(
        &self,
        door: Door,
        request: &CommandRequest,
        event_type: AccessEventType,
        error: EngineError,
        now: DateTime<Utc>,
    ) -> FailedTransition {
        let action = failure_audit_action(request.command);
        let details = format!(
            "Failed to {} door {} ({}): {}",
            request.command.action(),
            door.name,
            door.id,
            error
        );
        let event = AccessEvent::new(&door.id, event_type, AccessResult::Error, now)
            .with_tenant(request.tenant_id.as_deref())
            .with_notes(error.to_string());

        warn!(
            door_id = %door.id,
            action = %request.command.action(),
            error = %error,
            "door_command_failed"
        );

        match self.events.append(&event).await {
            Ok(()) => {
                let audit = AuditLogEntry::for_event(&action, &event, details);
                FailedTransition { door, error, event: Some(event), audit }
            }
            Err(write_err) => {
                self.metrics.record_event_write_failure();
                error!(door_id = %door.id, error = %write_err, "failure_event_write_failed");
                let audit = AuditLogEntry::new(&action, "door", &door.id, details, now);
                let error = EngineError::Persistence(format!(
                    "{error}; failure event not recorded: {write_err}"
                ));
                FailedTransition { door, error, event: None, audit }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::door::{AccessMethod, DoorType};
    use crate::infra::store::{encode, Filter, MemoryStore, ACCESS_EVENTS};
    use crate::services::hardware::{HardwareError, SimulatedController};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Controller that remembers where it last drove the door. Each call can
    /// be given its own acknowledgement delay, in order.
    #[derive(Default)]
    struct TrackingController {
        position: Mutex<Option<DoorStatus>>,
        delays: Mutex<VecDeque<Duration>>,
        calls: AtomicUsize,
    }

    impl TrackingController {
        fn with_delays(delays: &[u64]) -> Self {
            let controller = Self::default();
            controller.delays.lock().extend(delays.iter().map(|ms| Duration::from_millis(*ms)));
            controller
        }

        fn position(&self) -> Option<DoorStatus> {
            *self.position.lock()
        }
    }

    #[async_trait]
    impl DoorHardware for TrackingController {
        async fn apply(&self, _door: &Door, target: DoorStatus) -> Result<u64, HardwareError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delays.lock().pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            *self.position.lock() = Some(target);
            Ok(0)
        }
    }

    /// Memory store whose reads yield to the scheduler, so commands from
    /// different machines interleave between read and write
    struct InterleavingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for InterleavingStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            let doc = self.inner.get(collection, id).await;
            tokio::task::yield_now().await;
            doc
        }

        async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
            self.inner.list(collection, filter).await
        }

        async fn create(&self, collection: &str, data: Value) -> Result<Document, StoreError> {
            self.inner.create(collection, data).await
        }

        async fn update(
            &self,
            collection: &str,
            id: &str,
            data: Value,
            expected_version: Option<u64>,
        ) -> Result<Document, StoreError> {
            self.inner.update(collection, id, data, expected_version).await
        }
    }

    /// A second engine instance: shares store and controller, has its own door locks
    fn instance(
        store: Arc<dyn DocumentStore>,
        hardware: Arc<dyn DoorHardware>,
        metrics: Arc<Metrics>,
        cas_retries: u32,
    ) -> Arc<DoorStateMachine> {
        Arc::new(DoorStateMachine::new(
            store.clone(),
            hardware,
            EventStore::new(store),
            cas_retries,
            metrics,
        ))
    }

    fn door(is_active: bool, status: DoorStatus) -> Door {
        Door {
            id: "D1".to_string(),
            name: "Lobby".to_string(),
            location: "Ground floor".to_string(),
            property_id: Some("P1".to_string()),
            door_type: DoorType::Entry,
            access_method: AccessMethod::Keycard,
            is_active,
            status,
        }
    }

    async fn machine_with(d: Door) -> (DoorStateMachine, Arc<MemoryStore>, Arc<SimulatedController>) {
        let store = Arc::new(MemoryStore::new());
        store.create(DOORS, encode(&d).unwrap()).await.unwrap();
        let hardware = Arc::new(SimulatedController::new());
        let machine = DoorStateMachine::new(
            store.clone(),
            hardware.clone(),
            EventStore::new(store.clone()),
            3,
            Arc::new(Metrics::new()),
        );
        (machine, store, hardware)
    }

    #[test]
    fn test_plan_transitions() {
        let d = door(true, DoorStatus::Locked);
        let cases = [
            (DoorCommand::Lock, DoorStatus::Locked, AccessEventType::ManualLock, "door_lock"),
            (DoorCommand::Unlock, DoorStatus::Unlocked, AccessEventType::ManualUnlock, "door_unlock"),
            (
                DoorCommand::TempUnlock { auto_lock_seconds: 10 },
                DoorStatus::TempUnlocked,
                AccessEventType::TemporaryUnlock,
                "door_temp_unlock",
            ),
            (
                DoorCommand::EmergencyUnlock,
                DoorStatus::EmergencyUnlocked,
                AccessEventType::EmergencyUnlock,
                "door_emergency_unlock",
            ),
        ];
        for (command, to, event_type, action) in cases {
            let Plan::Apply(t) = plan(&d, command).unwrap() else {
                panic!("{:?} should apply", command);
            };
            assert_eq!(t.from, DoorStatus::Locked);
            assert_eq!(t.to, to);
            assert_eq!(t.event_type, event_type);
            assert_eq!(t.audit_action, action);
        }
    }

    #[test]
    fn test_status_check_is_read_only_in_every_state() {
        for status in [
            DoorStatus::Locked,
            DoorStatus::Unlocked,
            DoorStatus::TempUnlocked,
            DoorStatus::EmergencyUnlocked,
            DoorStatus::Offline,
        ] {
            assert_eq!(plan(&door(true, status), DoorCommand::StatusCheck).unwrap(), Plan::Read);
            assert_eq!(plan(&door(false, status), DoorCommand::StatusCheck).unwrap(), Plan::Read);
        }
    }

    #[test]
    fn test_inactive_door_only_allows_emergency_unlock() {
        let d = door(false, DoorStatus::Locked);
        for command in [
            DoorCommand::Lock,
            DoorCommand::Unlock,
            DoorCommand::TempUnlock { auto_lock_seconds: 10 },
        ] {
            assert_eq!(
                plan(&d, command).unwrap_err(),
                EngineError::DoorInactive { door_id: "D1".into() }
            );
        }
        assert!(matches!(plan(&d, DoorCommand::EmergencyUnlock), Ok(Plan::Apply(_))));
    }

    #[tokio::test]
    async fn test_execute_applies_and_records_event() {
        let (machine, store, _) = machine_with(door(true, DoorStatus::Locked)).await;
        let request = CommandRequest::new("D1", DoorCommand::Unlock).with_tenant("T1");
        let now = Utc::now();

        let Execution::Applied(applied) = machine.execute(&request, now, None).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(applied.door.status, DoorStatus::Unlocked);
        assert_eq!(applied.event.event_type, AccessEventType::ManualUnlock);
        assert_eq!(applied.event.result, AccessResult::Granted);
        assert_eq!(applied.event.tenant_id.as_deref(), Some("T1"));
        assert_eq!(applied.audit.action, "door_unlock");
        assert_eq!(applied.audit.timestamp, applied.event.timestamp);
        assert_eq!(applied.audit.correlation_id.as_deref(), Some(applied.event.id.as_str()));

        let (stored, version) = machine.load("D1").await.unwrap();
        assert_eq!(stored.status, DoorStatus::Unlocked);
        assert_eq!(version, 2);
        assert_eq!(store.count(ACCESS_EVENTS), 1);
    }

    #[tokio::test]
    async fn test_execute_status_check_writes_nothing() {
        let (machine, store, _) = machine_with(door(true, DoorStatus::Offline)).await;
        let request = CommandRequest::new("D1", DoorCommand::StatusCheck);
        let execution = machine.execute(&request, Utc::now(), None).await.unwrap();
        assert!(matches!(execution, Execution::Read(ref d) if d.status == DoorStatus::Offline));
        assert_eq!(store.count(ACCESS_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_execute_inactive_records_error_event() {
        let (machine, store, _) = machine_with(door(false, DoorStatus::Locked)).await;
        let request = CommandRequest::new("D1", DoorCommand::Unlock);

        let Execution::Failed(failed) = machine.execute(&request, Utc::now(), None).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(failed.error, EngineError::DoorInactive { door_id: "D1".into() });
        let event = failed.event.unwrap();
        assert_eq!(event.result, AccessResult::Error);
        assert_eq!(event.event_type, AccessEventType::ManualUnlock);
        assert_eq!(failed.audit.action, "door_unlock_failed");
        assert_eq!(store.count(ACCESS_EVENTS), 1);
        assert_eq!(machine.load("D1").await.unwrap().0.status, DoorStatus::Locked);
    }

    #[tokio::test]
    async fn test_execute_unreachable_controller() {
        let (machine, _, hardware) = machine_with(door(true, DoorStatus::Locked)).await;
        hardware.set_reachable("D1", false);
        let request = CommandRequest::new("D1", DoorCommand::Unlock);

        let Execution::Failed(failed) = machine.execute(&request, Utc::now(), None).await.unwrap() else {
            panic!("expected failure");
        };
        assert!(matches!(failed.error, EngineError::Hardware(_)));
        assert_eq!(failed.event.unwrap().event_type, AccessEventType::ControlFailure);
        assert_eq!(machine.load("D1").await.unwrap().0.status, DoorStatus::Locked);
    }

    #[tokio::test]
    async fn test_execute_unknown_door() {
        let (machine, store, _) = machine_with(door(true, DoorStatus::Locked)).await;
        let request = CommandRequest::new("D404", DoorCommand::Lock);
        let err = machine.execute(&request, Utc::now(), None).await.unwrap_err();
        assert_eq!(err, EngineError::not_found("door", "D404"));
        assert_eq!(store.count(ACCESS_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_precondition_skips() {
        let (machine, store, _) = machine_with(door(true, DoorStatus::EmergencyUnlocked)).await;
        let request = CommandRequest::new("D1", DoorCommand::Lock);
        let precondition = Precondition { status: DoorStatus::TempUnlocked, version: 1 };
        let execution = machine.execute(&request, Utc::now(), Some(precondition)).await.unwrap();
        assert!(matches!(execution, Execution::Skipped(_)));
        assert_eq!(store.count(ACCESS_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_precondition_checks_version() {
        let (machine, _, _) = machine_with(door(true, DoorStatus::Locked)).await;
        let temp_unlock = CommandRequest::new("D1", DoorCommand::TempUnlock { auto_lock_seconds: 5 });
        let Execution::Applied(first) = machine.execute(&temp_unlock, Utc::now(), None).await.unwrap() else {
            panic!("expected applied");
        };
        let Execution::Applied(second) = machine.execute(&temp_unlock, Utc::now(), None).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!((first.version, second.version), (2, 3));

        // The earlier unlock's timer must not cut the newer window short
        let lock = CommandRequest::new("D1", DoorCommand::Lock);
        let stale = Precondition { status: DoorStatus::TempUnlocked, version: first.version };
        let execution = machine.execute(&lock, Utc::now(), Some(stale)).await.unwrap();
        assert!(matches!(execution, Execution::Skipped(ref d) if d.status == DoorStatus::TempUnlocked));

        let current = Precondition { status: DoorStatus::TempUnlocked, version: second.version };
        let execution = machine.execute(&lock, Utc::now(), Some(current)).await.unwrap();
        assert!(matches!(execution, Execution::Applied(ref a) if a.door.status == DoorStatus::Locked));
    }

    #[tokio::test]
    async fn test_command_keeps_unmodelled_fields() {
        let store = Arc::new(MemoryStore::new());
        store
            .create(
                DOORS,
                serde_json::json!({ "id": "D9", "name": "Garage", "door_type": "garage",
                                    "zone": "B2", "is_active": true, "status": "locked" }),
            )
            .await
            .unwrap();
        let machine = instance(store.clone(), Arc::new(SimulatedController::new()), Arc::new(Metrics::new()), 3);

        let request = CommandRequest::new("D9", DoorCommand::Unlock);
        let Execution::Applied(applied) = machine.execute(&request, Utc::now(), None).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(applied.door.door_type, DoorType::Other);

        let doc = store.get(DOORS, "D9").await.unwrap().unwrap();
        assert_eq!(doc.data["status"], "unlocked");
        assert_eq!(doc.data["door_type"], "garage");
        assert_eq!(doc.data["zone"], "B2");
    }

    #[tokio::test]
    async fn test_hardware_failure_reverts_record() {
        let (machine, store, hardware) = machine_with(door(true, DoorStatus::Locked)).await;
        hardware.set_reachable("D1", false);

        let request = CommandRequest::new("D1", DoorCommand::TempUnlock { auto_lock_seconds: 5 });
        let execution = machine.execute(&request, Utc::now(), None).await.unwrap();
        assert!(matches!(execution, Execution::Failed(_)));

        let doc = store.get(DOORS, "D1").await.unwrap().unwrap();
        assert_eq!(doc.data["status"], "locked");
        // Committed, then put back
        assert_eq!(doc.version, 3);
    }

    #[tokio::test]
    async fn test_instances_sharing_a_store_stay_consistent() {
        let store: Arc<dyn DocumentStore> = Arc::new(InterleavingStore { inner: MemoryStore::new() });
        store.create(DOORS, encode(&door(true, DoorStatus::Locked)).unwrap()).await.unwrap();
        let hardware = Arc::new(TrackingController::default());
        let metrics = Arc::new(Metrics::new());
        let a = instance(store.clone(), hardware.clone(), metrics.clone(), 10);
        let b = instance(store.clone(), hardware.clone(), metrics.clone(), 10);

        let mut handles = Vec::new();
        for i in 0..16 {
            let machine = if i % 2 == 0 { a.clone() } else { b.clone() };
            let command = if i % 4 < 2 { DoorCommand::Unlock } else { DoorCommand::Lock };
            handles.push(tokio::spawn(async move {
                machine.execute(&CommandRequest::new("D1", command), Utc::now(), None).await
            }));
        }
        let mut applied = 0;
        for h in handles {
            if let Execution::Applied(_) = h.await.unwrap().unwrap() {
                applied += 1;
            }
        }

        assert!(metrics.cas_conflicts() > 0);
        let (stored, version) = a.load("D1").await.unwrap();
        assert_eq!(version, 1 + applied);
        assert_eq!(hardware.position(), Some(stored.status));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acknowledgement_is_resynced() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store.create(DOORS, encode(&door(true, DoorStatus::Locked)).unwrap()).await.unwrap();
        // First command acks after 100ms, the second after 10ms
        let hardware = Arc::new(TrackingController::with_delays(&[100, 10]));
        let metrics = Arc::new(Metrics::new());
        let a = instance(store.clone(), hardware.clone(), metrics.clone(), 3);
        let b = instance(store.clone(), hardware.clone(), metrics.clone(), 3);

        let slow = tokio::spawn(async move {
            a.execute(&CommandRequest::new("D1", DoorCommand::Unlock), Utc::now(), None).await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fast = b.execute(&CommandRequest::new("D1", DoorCommand::Lock), Utc::now(), None).await;
        assert!(matches!(fast.unwrap(), Execution::Applied(_)));
        assert_eq!(hardware.position(), Some(DoorStatus::Locked));

        // The unlock acknowledges last, then drives the controller back to the stored lock
        assert!(matches!(slow.await.unwrap().unwrap(), Execution::Applied(_)));
        let (stored, _) = b.load("D1").await.unwrap();
        assert_eq!(stored.status, DoorStatus::Locked);
        assert_eq!(hardware.position(), Some(DoorStatus::Locked));
        assert_eq!(hardware.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_commands_serialize() {
        let (machine, store, _) = machine_with(door(true, DoorStatus::Locked)).await;
        let machine = Arc::new(machine);

        let mut handles = Vec::new();
        for i in 0..20 {
            let machine = machine.clone();
            let command = if i % 2 == 0 { DoorCommand::Unlock } else { DoorCommand::Lock };
            handles.push(tokio::spawn(async move {
                machine.execute(&CommandRequest::new("D1", command), Utc::now(), None).await
            }));
        }
        for h in handles {
            assert!(matches!(h.await.unwrap().unwrap(), Execution::Applied(_)));
        }

        // Every command advanced the version exactly once
        let (stored, version) = machine.load("D1").await.unwrap();
        assert_eq!(version, 21);
        assert!(matches!(stored.status, DoorStatus::Locked | DoorStatus::Unlocked));
        assert_eq!(store.count(ACCESS_EVENTS), 20);
    }
}
