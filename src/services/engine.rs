//! Access control engine
//!
//! Orchestrates one request at a time: door commands through the state
//! machine, tenant status reports through the lease evaluator and the
//! aggregator, and physical access attempts. Every invocation runs under a
//! deadline. Audit failures after an applied change come back as a warning on
//! the reply, never as an error.
//!
//! Door commands run on their own task. A deadline answers the caller with a
//! timeout but never interrupts a command between its door write and its
//! access event; the trail is finished in the background with whatever the
//! command actually did.

use crate::domain::command::{AttemptRequest, CommandRequest, DoorCommand, StatusRequest};
use crate::domain::door::{AccessMethod, Door, DoorStatus, DoorType};
use crate::domain::error::{EngineError, EngineResult};
use crate::domain::event::{AccessEvent, AccessEventType, AccessResult, AuditLogEntry};
use crate::domain::tenant::{AccessStatus, Tenant, TenantLeaseStatus};
use crate::infra::config::Config;
use crate::infra::metrics::{CommandOutcomeKind, Metrics};
use crate::infra::store::{DocumentStore, Filter, DOORS};
use crate::io::event_feed::FeedSender;
use crate::services::aggregator::{self, AccessStatistics, Alert};
use crate::services::audit_logger::AuditLogger;
use crate::services::directory::TenantDirectory;
use crate::services::door_machine::{
    event_type_for, failure_audit_action, success_message, DoorStateMachine, Execution,
    Precondition,
};
use crate::services::event_store::EventStore;
use crate::services::hardware::DoorHardware;
use crate::services::lease_evaluator::{self, LeaseEvaluation, LeaseInfo};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tunables for one engine instance
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub command_timeout: Duration,
    pub default_auto_lock_seconds: u64,
    pub cas_retries: u32,
    pub stats_window_days: i64,
    pub recent_events_limit: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_timeout: Duration::from_millis(config.command_timeout_ms()),
            default_auto_lock_seconds: config.default_auto_lock_seconds(),
            cas_retries: config.cas_retries(),
            stats_window_days: config.stats_window_days(),
            recent_events_limit: config.recent_events_limit(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Successful result plus an optional partial-failure warning
#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub data: T,
    pub warning: Option<String>,
}

impl<T> Reply<T> {
    fn new(data: T, warning: Option<String>) -> Self {
        Self { data, warning }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub door_id: String,
    pub action: &'static str,
    pub status: DoorStatus,
    pub door_name: String,
    pub door_location: String,
    pub door_type: DoorType,
    /// Re-lock hint for temporary unlocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_lock_seconds: Option<u64>,
    pub message: String,
    /// Door version this command wrote; None for reads
    #[serde(skip)]
    pub version: Option<u64>,
}

impl CommandOutcome {
    fn new(door: &Door, command: DoorCommand, version: Option<u64>) -> Self {
        let auto_lock_seconds = match command {
            DoorCommand::TempUnlock { auto_lock_seconds } => Some(auto_lock_seconds),
            _ => None,
        };
        Self {
            door_id: door.id.clone(),
            action: command.action(),
            status: door.status,
            door_name: door.name.clone(),
            door_location: door.location.clone(),
            door_type: door.door_type,
            auto_lock_seconds,
            message: success_message(command),
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantInfo {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub unit: Option<String>,
    pub property_id: Option<String>,
    pub lease_status: TenantLeaseStatus,
    pub move_in_date: Option<NaiveDate>,
    pub move_out_date: Option<NaiveDate>,
}

impl From<&Tenant> for TenantInfo {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id.clone(),
            name: tenant.name.clone(),
            email: tenant.email.clone(),
            unit: tenant.unit.clone(),
            property_id: tenant.property_id.clone(),
            lease_status: tenant.lease_status,
            move_in_date: tenant.move_in_date,
            move_out_date: tenant.move_out_date,
        }
    }
}

/// A door the tenant may currently use, with their usage of it in the window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessibleDoor {
    pub door_id: String,
    pub name: String,
    pub location: String,
    pub door_type: DoorType,
    pub access_method: AccessMethod,
    pub status: DoorStatus,
    pub access_count: u64,
    pub last_access: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub tenant_info: TenantInfo,
    pub access_status: AccessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_info: Option<LeaseInfo>,
    pub access_statistics: AccessStatistics,
    pub accessible_doors: Vec<AccessibleDoor>,
    pub recent_access_events: Vec<AccessEvent>,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptOutcome {
    pub door_id: String,
    pub tenant_id: String,
    pub granted: bool,
    pub result: AccessResult,
    pub reason: String,
    pub event_id: String,
}

/// Decide a credential presentation at a door. Checks run in order; the first
/// failing one is the denial reason.
pub fn decide_attempt(door: &Door, tenant: &Tenant, evaluation: &LeaseEvaluation) -> (bool, String) {
    if !door.is_active {
        return (false, "Door is inactive".to_string());
    }
    if door.status == DoorStatus::Offline {
        return (false, "Door is offline".to_string());
    }
    if !evaluation.access.is_active {
        return (false, format!("Access denied: {}", evaluation.access.reason));
    }
    let property = evaluation
        .lease
        .as_ref()
        .and_then(|lease| lease.property_id.as_deref())
        .or(tenant.property_id.as_deref());
    if let (Some(door_property), Some(property)) = (door.property_id.as_deref(), property) {
        if door_property != property {
            return (false, "Door is not part of the leased property".to_string());
        }
    }
    (true, "Access granted".to_string())
}

/// Writers for trails finished off the request path
#[derive(Clone)]
struct Trail {
    events: EventStore,
    audit: AuditLogger,
    metrics: Arc<Metrics>,
    feed: Option<FeedSender>,
}

impl Trail {
    fn publish(&self, event: &AccessEvent) {
        if let Some(feed) = &self.feed {
            feed.send_event(event);
        }
    }

    async fn record_event(&self, event: &AccessEvent) {
        match self.events.append(event).await {
            Ok(()) => self.publish(event),
            Err(e) => {
                self.metrics.record_event_write_failure();
                error!(door_id = %event.door_id, error = %e, "failure_event_write_failed");
            }
        }
    }

    async fn record_audit(&self, entry: &AuditLogEntry) {
        match self.audit.append(entry).await {
            Ok(()) => {
                if let Some(feed) = &self.feed {
                    feed.send_audit(entry);
                }
            }
            Err(_) => self.metrics.record_audit_write_failure(),
        }
    }
}

pub struct AccessControlEngine {
    store: Arc<dyn DocumentStore>,
    directory: Arc<dyn TenantDirectory>,
    machine: Arc<DoorStateMachine>,
    events: EventStore,
    audit: AuditLogger,
    metrics: Arc<Metrics>,
    feed: Option<FeedSender>,
    settings: EngineSettings,
}

impl AccessControlEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn TenantDirectory>,
        hardware: Arc<dyn DoorHardware>,
        metrics: Arc<Metrics>,
        settings: EngineSettings,
    ) -> Self {
        let events = EventStore::new(store.clone());
        let machine = Arc::new(DoorStateMachine::new(
            store.clone(),
            hardware,
            events.clone(),
            settings.cas_retries,
            metrics.clone(),
        ));
        Self {
            audit: AuditLogger::new(store.clone()),
            store,
            directory,
            machine,
            events,
            metrics,
            feed: None,
            settings,
        }
    }

    /// Publish persisted events and audit entries to the feed
    pub fn with_feed(mut self, feed: FeedSender) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Execute a door command
    pub async fn command(&self, request: CommandRequest) -> EngineResult<Reply<CommandOutcome>> {
        let start = Instant::now();
        let result = self.run_command(&request, None).await.and_then(|reply| {
            reply.ok_or_else(|| EngineError::Persistence("door command was skipped".to_string()))
        });
        self.record_command_metrics(&result, start);
        result
    }

    /// Timer path for temporary unlocks: lock only if the door is still in
    /// the temp-unlocked state written at `version`. `Ok(None)` means the door
    /// had moved on (another command, or a newer temporary unlock with its own
    /// timer) and nothing was recorded.
    pub async fn relock(&self, door_id: &str, version: u64) -> EngineResult<Option<Reply<CommandOutcome>>> {
        let request = CommandRequest::new(door_id, DoorCommand::Lock)
            .with_reason("Automatic re-lock after temporary unlock");
        let precondition = Precondition { status: DoorStatus::TempUnlocked, version };
        let start = Instant::now();
        let result = self.run_command(&request, Some(precondition)).await;
        if !matches!(result, Ok(None)) {
            self.record_command_metrics(&result, start);
        }
        result
    }

    async fn run_command(
        &self,
        request: &CommandRequest,
        precondition: Option<Precondition>,
    ) -> EngineResult<Option<Reply<CommandOutcome>>> {
        let now = Utc::now();
        let machine = self.machine.clone();
        let task_request = request.clone();
        let mut task =
            tokio::spawn(async move { machine.execute(&task_request, now, precondition).await });

        let execution = match tokio::time::timeout(self.settings.command_timeout, &mut task).await {
            Ok(joined) => flatten_join(joined),
            Err(_) => {
                self.metrics.record_timeout();
                let e = EngineError::Timeout(self.settings.command_timeout.as_millis() as u64);
                warn!(
                    door_id = %request.door_id,
                    action = %request.command.action(),
                    error = %e,
                    "door_command_timeout"
                );
                self.spawn_timeout_trail(task, request.clone(), now);
                return Err(e);
            }
        };

        let execution = match execution {
            Ok(execution) => execution,
            Err(e) => {
                // Door status reads never leave an audit entry, failed or not
                if matches!(e, EngineError::Persistence(_)) && request.command.is_mutating() {
                    let entry = AuditLogEntry::new(
                        &failure_audit_action(request.command),
                        "door",
                        &request.door_id,
                        format!("Failed to {} door {}: {}", request.command.action(), request.door_id, e),
                        now,
                    );
                    self.write_audit(&entry).await;
                }
                warn!(
                    door_id = %request.door_id,
                    action = %request.command.action(),
                    error = %e,
                    "door_command_rejected"
                );
                return Err(e);
            }
        };

        match execution {
            Execution::Read(door) => {
                debug!(door_id = %door.id, status = %door.status, "door_status_read");
                Ok(Some(Reply::new(CommandOutcome::new(&door, request.command, None), None)))
            }
            Execution::Skipped(door) => {
                debug!(door_id = %door.id, status = %door.status, "door_command_skipped");
                Ok(None)
            }
            Execution::Applied(applied) => {
                self.publish_event(&applied.event);
                let warning = self.write_audit(&applied.audit).await;
                info!(
                    door_id = %applied.door.id,
                    action = %request.command.action(),
                    from = %applied.transition.from,
                    to = %applied.transition.to,
                    tenant_id = ?request.tenant_id,
                    "door_command_applied"
                );
                let outcome = CommandOutcome::new(&applied.door, request.command, Some(applied.version));
                Ok(Some(Reply::new(outcome, warning)))
            }
            Execution::Failed(failed) => {
                if let Some(event) = &failed.event {
                    self.publish_event(event);
                }
                self.write_audit(&failed.audit).await;
                Err(failed.error)
            }
        }
    }

    /// Build a tenant's access status report
    pub async fn access_status(&self, request: StatusRequest) -> EngineResult<Reply<StatusReport>> {
        let now = Utc::now();
        self.metrics.record_status_check();

        let report = match self.with_deadline(self.build_report(&request.tenant_id, now)).await {
            Ok(report) => report,
            Err(e) => {
                if matches!(e, EngineError::Persistence(_) | EngineError::Timeout(_)) {
                    let entry = AuditLogEntry::new(
                        "access_status_check_failed",
                        "tenant",
                        &request.tenant_id,
                        format!("Access status check failed: {}", e),
                        now,
                    );
                    self.spawn_trail(None, entry);
                }
                warn!(tenant_id = %request.tenant_id, error = %e, "access_status_failed");
                return Err(e);
            }
        };

        let entry = AuditLogEntry::new(
            "access_status_check",
            "tenant",
            &request.tenant_id,
            format!(
                "Access status checked: {} ({})",
                report.access_status.status.as_str(),
                report.access_status.reason
            ),
            now,
        );
        let warning = self.write_audit(&entry).await;

        info!(
            tenant_id = %request.tenant_id,
            status = %report.access_status.status.as_str(),
            events = %report.access_statistics.total_access_attempts,
            alerts = %report.alerts.len(),
            "access_status_checked"
        );
        Ok(Reply::new(report, warning))
    }

    async fn build_report(&self, tenant_id: &str, now: DateTime<Utc>) -> EngineResult<StatusReport> {
        let tenant = self
            .directory
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| EngineError::not_found("tenant", tenant_id))?;
        let leases = self.directory.list_active_leases(tenant_id).await?;
        let evaluation = lease_evaluator::evaluate(&tenant, &leases, now)?;

        let since = aggregator::window_start(now, self.settings.stats_window_days);
        let events = self.events.for_tenant(tenant_id, since).await?;
        let statistics = aggregator::aggregate(&events, since);
        let alerts = aggregator::alerts(&statistics, Some(evaluation.access.status));
        let recent_access_events =
            aggregator::recent_events(&events, since, self.settings.recent_events_limit);
        let accessible_doors = self.accessible_doors(&tenant, &evaluation, &statistics).await?;

        Ok(StatusReport {
            tenant_info: TenantInfo::from(&tenant),
            lease_info: evaluation.lease.as_ref().map(|lease| LeaseInfo::from_lease(lease, now)),
            access_status: evaluation.access,
            access_statistics: statistics,
            accessible_doors,
            recent_access_events,
            alerts,
        })
    }

    /// Active doors on the tenant's leased property. Empty unless access is active.
    async fn accessible_doors(
        &self,
        tenant: &Tenant,
        evaluation: &LeaseEvaluation,
        statistics: &AccessStatistics,
    ) -> EngineResult<Vec<AccessibleDoor>> {
        if !evaluation.access.is_active {
            return Ok(Vec::new());
        }
        let property = evaluation
            .lease
            .as_ref()
            .and_then(|lease| lease.property_id.clone())
            .or_else(|| tenant.property_id.clone());
        let Some(property) = property else {
            return Ok(Vec::new());
        };

        let filter = Filter::new().eq("property_id", property).eq("is_active", true);
        let docs = self.store.list(DOORS, &filter).await?;
        let mut doors = Vec::with_capacity(docs.len());
        for doc in &docs {
            let door: Door = doc.decode()?;
            let usage = statistics.by_door.iter().find(|d| d.door_id == door.id);
            doors.push(AccessibleDoor {
                access_count: usage.map_or(0, |d| d.total),
                last_access: usage.and_then(|d| d.last_access),
                door_id: door.id,
                name: door.name,
                location: door.location,
                door_type: door.door_type,
                access_method: door.access_method,
                status: door.status,
            });
        }
        Ok(doors)
    }

    /// Decide and record a credential presentation at a door
    pub async fn access_attempt(&self, request: AttemptRequest) -> EngineResult<Reply<AttemptOutcome>> {
        let now = Utc::now();
        let result = self.with_deadline(self.decide_and_record(&request, now)).await;

        let (event, outcome) = match result {
            Ok(decided) => decided,
            Err(e) => {
                if matches!(e, EngineError::Persistence(_) | EngineError::Timeout(_)) {
                    let event = AccessEvent::new(
                        &request.door_id,
                        AccessEventType::AccessAttempt,
                        AccessResult::Error,
                        now,
                    )
                    .with_tenant(Some(&request.tenant_id))
                    .with_notes(e.to_string());
                    let entry = AuditLogEntry::for_event(
                        "access_attempt_failed",
                        &event,
                        format!("Access attempt by tenant {} failed: {}", request.tenant_id, e),
                    );
                    let event = matches!(e, EngineError::Timeout(_)).then_some(event);
                    self.spawn_trail(event, entry);
                }
                warn!(
                    door_id = %request.door_id,
                    tenant_id = %request.tenant_id,
                    error = %e,
                    "access_attempt_failed"
                );
                return Err(e);
            }
        };

        self.metrics.record_access_attempt(outcome.granted);
        self.publish_event(&event);
        let entry = AuditLogEntry::for_event(
            "access_attempt",
            &event,
            format!(
                "Tenant {} {} at door {}: {}",
                request.tenant_id,
                if outcome.granted { "granted" } else { "denied" },
                request.door_id,
                outcome.reason
            ),
        );
        let warning = self.write_audit(&entry).await;

        info!(
            door_id = %request.door_id,
            tenant_id = %request.tenant_id,
            granted = %outcome.granted,
            reason = %outcome.reason,
            "access_attempt"
        );
        Ok(Reply::new(outcome, warning))
    }

    async fn decide_and_record(
        &self,
        request: &AttemptRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<(AccessEvent, AttemptOutcome)> {
        let (door, _) = self.machine.load(&request.door_id).await?;
        let tenant = self
            .directory
            .get_tenant(&request.tenant_id)
            .await?
            .ok_or_else(|| EngineError::not_found("tenant", request.tenant_id.as_str()))?;
        let leases = self.directory.list_active_leases(&request.tenant_id).await?;
        let evaluation = lease_evaluator::evaluate(&tenant, &leases, now)?;

        let (granted, reason) = decide_attempt(&door, &tenant, &evaluation);
        let result = if granted { AccessResult::Granted } else { AccessResult::Denied };
        let event = AccessEvent::new(&door.id, AccessEventType::AccessAttempt, result, now)
            .with_tenant(Some(&tenant.id))
            .with_notes(reason.clone());

        self.events.append(&event).await.inspect_err(|_| {
            self.metrics.record_event_write_failure();
        })?;

        let outcome = AttemptOutcome {
            door_id: door.id,
            tenant_id: tenant.id,
            granted,
            result,
            reason,
            event_id: event.id.clone(),
        };
        Ok((event, outcome))
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
        match tokio::time::timeout(self.settings.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_timeout();
                Err(EngineError::Timeout(self.settings.command_timeout.as_millis() as u64))
            }
        }
    }

    /// Persist an audit entry under the deadline. Returns a warning on failure.
    async fn write_audit(&self, entry: &AuditLogEntry) -> Option<String> {
        match tokio::time::timeout(self.settings.command_timeout, self.audit.append(entry)).await {
            Ok(Ok(())) => {
                if let Some(feed) = &self.feed {
                    feed.send_audit(entry);
                }
                None
            }
            Ok(Err(e)) => {
                self.metrics.record_audit_write_failure();
                Some(format!("audit log write failed: {}", e))
            }
            Err(_) => {
                self.metrics.record_audit_write_failure();
                warn!(action = %entry.action, resource_id = %entry.resource_id, "audit_write_timeout");
                Some(format!(
                    "audit log write timed out after {} ms",
                    self.settings.command_timeout.as_millis()
                ))
            }
        }
    }

    fn publish_event(&self, event: &AccessEvent) {
        if let Some(feed) = &self.feed {
            feed.send_event(event);
        }
    }

    fn trail(&self) -> Trail {
        Trail {
            events: self.events.clone(),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
            feed: self.feed.clone(),
        }
    }

    /// Finish the trail of a command that outlived its deadline. The command
    /// keeps running; what it ends up doing is what gets recorded. Reads and
    /// skipped re-locks leave nothing behind.
    fn spawn_timeout_trail(
        &self,
        task: JoinHandle<EngineResult<Execution>>,
        request: CommandRequest,
        now: DateTime<Utc>,
    ) {
        let trail = self.trail();
        let timeout_ms = self.settings.command_timeout.as_millis();
        tokio::spawn(async move {
            match flatten_join(task.await) {
                Ok(Execution::Applied(applied)) => {
                    trail.publish(&applied.event);
                    trail.record_audit(&applied.audit).await;
                    warn!(
                        door_id = %applied.door.id,
                        action = %request.command.action(),
                        status = %applied.door.status,
                        "door_command_applied_after_deadline"
                    );
                }
                Ok(Execution::Failed(failed)) => {
                    if let Some(event) = &failed.event {
                        trail.publish(event);
                    }
                    trail.record_audit(&failed.audit).await;
                }
                Ok(Execution::Read(_) | Execution::Skipped(_)) => {}
                // Rejected before touching the door
                Err(e) if e.http_status() < 500 => {}
                Err(e) => {
                    let Some(event_type) = event_type_for(request.command) else {
                        return;
                    };
                    let details = format!(
                        "{} door {} timed out after {} ms: {}",
                        request.command.action(),
                        request.door_id,
                        timeout_ms,
                        e
                    );
                    let event = AccessEvent::new(&request.door_id, event_type, AccessResult::Error, now)
                        .with_tenant(request.tenant_id.as_deref())
                        .with_notes(details.clone());
                    let entry =
                        AuditLogEntry::for_event(&failure_audit_action(request.command), &event, details);
                    trail.record_event(&event).await;
                    trail.record_audit(&entry).await;
                }
            }
        });
    }

    /// Best-effort background write of a failure trail. Never awaited by the caller.
    fn spawn_trail(&self, event: Option<AccessEvent>, entry: AuditLogEntry) {
        let trail = self.trail();
        tokio::spawn(async move {
            if let Some(event) = event {
                trail.record_event(&event).await;
            }
            trail.record_audit(&entry).await;
        });
    }

    fn record_command_metrics<T>(&self, result: &EngineResult<T>, start: Instant) {
        let outcome = match result {
            Ok(_) => CommandOutcomeKind::Applied,
            Err(e) if e.http_status() < 500 => CommandOutcomeKind::Rejected,
            Err(_) => CommandOutcomeKind::Failed,
        };
        self.metrics.record_command(outcome, start.elapsed().as_micros() as u64);
    }
}

fn flatten_join(
    joined: Result<EngineResult<Execution>, tokio::task::JoinError>,
) -> EngineResult<Execution> {
    joined.map_err(|e| EngineError::Persistence(format!("door command task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tenant::{AccessStatusKind, Lease, LeaseStatus};
    use crate::infra::store::{
        encode, Document, MemoryStore, StoreError, ACCESS_EVENTS, AUDIT_LOG, LEASES, TENANTS,
    };
    use crate::services::directory::StoreDirectory;
    use crate::services::hardware::SimulatedController;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Memory store that can be told to fail writes to one collection, or to
    /// answer reads slowly
    struct FaultyStore {
        inner: MemoryStore,
        fail_audit: AtomicBool,
        /// Number of upcoming access event writes to fail
        failing_event_writes: AtomicUsize,
        read_delay_ms: AtomicU64,
    }

    impl FaultyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_audit: AtomicBool::new(false),
                failing_event_writes: AtomicUsize::new(0),
                read_delay_ms: AtomicU64::new(0),
            }
        }

        fn fail_event_writes(&self, count: usize) {
            self.failing_event_writes.store(count, Ordering::SeqCst);
        }

        fn event_write_fails(&self) -> bool {
            self.failing_event_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        async fn door(&self, id: &str) -> Door {
            self.inner.get(DOORS, id).await.unwrap().unwrap().decode().unwrap()
        }
    }

    #[async_trait]
    impl DocumentStore for FaultyStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            let delay_ms = self.read_delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            self.inner.get(collection, id).await
        }

        async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
            self.inner.list(collection, filter).await
        }

        async fn create(&self, collection: &str, data: Value) -> Result<Document, StoreError> {
            if collection == AUDIT_LOG && self.fail_audit.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("audit store down".to_string()));
            }
            if collection == ACCESS_EVENTS && self.event_write_fails() {
                return Err(StoreError::Unavailable("event store down".to_string()));
            }
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

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    async fn seed(store: &dyn DocumentStore) {
        let doors = [
            json!({ "id": "D1", "name": "Lobby", "location": "Ground floor", "property_id": "P1",
                    "door_type": "entry", "access_method": "keycard", "is_active": true, "status": "locked" }),
            json!({ "id": "D2", "name": "Gym", "location": "Level 2", "property_id": "P1",
                    "door_type": "interior", "is_active": false, "status": "locked" }),
            json!({ "id": "D3", "name": "Garage", "location": "Basement", "property_id": "P2",
                    "door_type": "entry", "is_active": true, "status": "locked" }),
            json!({ "id": "D4", "name": "Roof", "location": "Roof", "property_id": "P1",
                    "door_type": "emergency", "is_active": true, "status": "offline" }),
        ];
        for door in doors {
            store.create(DOORS, door).await.unwrap();
        }

        let tenants = [
            json!({ "id": "T1", "name": "Ada", "property_id": "P1", "lease_status": "active" }),
            json!({ "id": "T2", "name": "Grace", "property_id": "P1", "lease_status": "active" }),
        ];
        for tenant in tenants {
            store.create(TENANTS, tenant).await.unwrap();
        }

        let expired = Lease {
            id: "L1".to_string(),
            tenant_id: "T1".to_string(),
            property_id: Some("P1".to_string()),
            start_date: Some(today() - ChronoDuration::days(365)),
            end_date: Some(today() - ChronoDuration::days(1)),
            status: LeaseStatus::Active,
        };
        let current = Lease {
            id: "L2".to_string(),
            tenant_id: "T2".to_string(),
            property_id: Some("P1".to_string()),
            start_date: Some(today() - ChronoDuration::days(30)),
            end_date: Some(today() + ChronoDuration::days(300)),
            status: LeaseStatus::Active,
        };
        store.create(LEASES, encode(&expired).unwrap()).await.unwrap();
        store.create(LEASES, encode(&current).unwrap()).await.unwrap();
    }

    async fn engine_with(settings: EngineSettings) -> (AccessControlEngine, Arc<FaultyStore>, Arc<SimulatedController>) {
        let store = Arc::new(FaultyStore::new());
        seed(store.as_ref()).await;
        let hardware = Arc::new(SimulatedController::new());
        let engine = AccessControlEngine::new(
            store.clone(),
            Arc::new(StoreDirectory::new(store.clone())),
            hardware.clone(),
            Arc::new(Metrics::new()),
            settings,
        );
        (engine, store, hardware)
    }

    async fn engine() -> (AccessControlEngine, Arc<FaultyStore>, Arc<SimulatedController>) {
        engine_with(EngineSettings::default()).await
    }

    #[tokio::test]
    async fn test_unlock_records_event_and_audit() {
        let (engine, store, _) = engine().await;

        let reply = engine
            .command(CommandRequest::new("D1", DoorCommand::Unlock).with_tenant("T2"))
            .await
            .unwrap();
        assert!(reply.warning.is_none());
        assert_eq!(reply.data.status, DoorStatus::Unlocked);
        assert_eq!(reply.data.door_name, "Lobby");
        assert_eq!(reply.data.action, "unlock");
        assert!(reply.data.auto_lock_seconds.is_none());

        assert_eq!(store.inner.count(ACCESS_EVENTS), 1);
        assert_eq!(store.inner.count(AUDIT_LOG), 1);
        let audit = AuditLogger::new(store.clone()).entries_for("door", "D1").await.unwrap();
        assert_eq!(audit[0].action, "door_unlock");
    }

    #[tokio::test]
    async fn test_temp_unlock_returns_hint() {
        let (engine, _, _) = engine().await;
        let reply = engine
            .command(CommandRequest::new("D1", DoorCommand::TempUnlock { auto_lock_seconds: 15 }))
            .await
            .unwrap();
        assert_eq!(reply.data.status, DoorStatus::TempUnlocked);
        assert_eq!(reply.data.auto_lock_seconds, Some(15));
        assert_eq!(reply.data.message, "Door temporarily unlocked for 15 seconds");
    }

    #[tokio::test]
    async fn test_inactive_door_rejects_but_records_error_event() {
        let (engine, store, _) = engine().await;

        let err = engine.command(CommandRequest::new("D2", DoorCommand::Lock)).await.unwrap_err();
        assert_eq!(err, EngineError::DoorInactive { door_id: "D2".into() });
        assert_eq!(err.http_status(), 400);
        assert_eq!(store.inner.count(ACCESS_EVENTS), 1);
        assert_eq!(store.inner.count(AUDIT_LOG), 1);

        let reply = engine.command(CommandRequest::new("D2", DoorCommand::EmergencyUnlock)).await.unwrap();
        assert_eq!(reply.data.status, DoorStatus::EmergencyUnlocked);
    }

    #[tokio::test]
    async fn test_status_check_leaves_no_trail() {
        let (engine, store, _) = engine().await;
        let reply = engine.command(CommandRequest::new("D4", DoorCommand::StatusCheck)).await.unwrap();
        assert_eq!(reply.data.status, DoorStatus::Offline);
        assert_eq!(store.inner.count(ACCESS_EVENTS), 0);
        assert_eq!(store.inner.count(AUDIT_LOG), 0);
    }

    #[tokio::test]
    async fn test_audit_failure_becomes_warning() {
        let (engine, store, _) = engine().await;
        store.fail_audit.store(true, Ordering::SeqCst);

        let reply = engine.command(CommandRequest::new("D1", DoorCommand::Unlock)).await.unwrap();
        assert_eq!(reply.data.status, DoorStatus::Unlocked);
        assert!(reply.warning.unwrap().contains("audit log write failed"));
        assert_eq!(store.inner.count(ACCESS_EVENTS), 1);
        assert_eq!(engine.metrics().audit_write_failures(), 1);
    }

    #[tokio::test]
    async fn test_event_write_failure_reverts_door_and_records_error_event() {
        let (engine, store, _) = engine().await;
        store.fail_event_writes(1);

        let err = engine.command(CommandRequest::new("D1", DoorCommand::Unlock)).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(err.http_status(), 500);
        // The command failed as a whole: the door is back where it was
        assert_eq!(store.door("D1").await.status, DoorStatus::Locked);

        let events = EventStore::new(store.clone())
            .for_door("D1", Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AccessEventType::ManualUnlock);
        assert_eq!(events[0].result, AccessResult::Error);

        let audit = AuditLogger::new(store.clone()).entries_for("door", "D1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "door_unlock_failed");
        assert_eq!(audit[0].correlation_id.as_deref(), Some(events[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_event_store_down_surfaces_both_failures() {
        let (engine, store, _) = engine().await;
        store.fail_event_writes(usize::MAX);

        let err = engine.command(CommandRequest::new("D1", DoorCommand::Unlock)).await.unwrap_err();
        let EngineError::Persistence(message) = &err else {
            panic!("expected persistence error, got {err:?}");
        };
        assert!(message.contains("failure event not recorded"));
        assert_eq!(store.door("D1").await.status, DoorStatus::Locked);
        assert_eq!(store.inner.count(ACCESS_EVENTS), 0);
        assert_eq!(store.inner.count(AUDIT_LOG), 1);
    }

    #[tokio::test]
    async fn test_hardware_failure() {
        let (engine, store, hardware) = engine().await;
        hardware.set_reachable("D1", false);

        let err = engine.command(CommandRequest::new("D1", DoorCommand::Unlock)).await.unwrap_err();
        assert!(matches!(err, EngineError::Hardware(_)));
        let events = EventStore::new(store.clone())
            .for_door("D1", Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AccessEventType::ControlFailure);
        assert_eq!(events[0].result, AccessResult::Error);
    }

    #[tokio::test]
    async fn test_command_timeout_finishes_trail_in_background() {
        let store = Arc::new(FaultyStore::new());
        seed(store.as_ref()).await;
        let hardware =
            Arc::new(SimulatedController::new().with_ack_delay(std::time::Duration::from_millis(200)));
        let settings = EngineSettings {
            command_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let engine = AccessControlEngine::new(
            store.clone(),
            Arc::new(StoreDirectory::new(store.clone())),
            hardware,
            Arc::new(Metrics::new()),
            settings,
        );

        let err = engine.command(CommandRequest::new("D1", DoorCommand::Unlock)).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout(20));

        // The controller acknowledged late; the command still completed as one unit
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(store.door("D1").await.status, DoorStatus::Unlocked);
        let events = EventStore::new(store.clone())
            .for_door("D1", Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, AccessResult::Granted);
        let audit = AuditLogger::new(store.clone()).entries_for("door", "D1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "door_unlock");
    }

    #[tokio::test]
    async fn test_status_check_timeout_leaves_no_trail() {
        let settings = EngineSettings {
            command_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let (engine, store, _) = engine_with(settings).await;
        store.read_delay_ms.store(100, Ordering::SeqCst);

        let err = engine.command(CommandRequest::new("D1", DoorCommand::StatusCheck)).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout(20));

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(store.inner.count(ACCESS_EVENTS), 0);
        assert_eq!(store.inner.count(AUDIT_LOG), 0);
    }

    #[tokio::test]
    async fn test_relock_only_from_temp_unlocked() {
        let (engine, store, _) = engine().await;

        assert!(engine.relock("D1", 1).await.unwrap().is_none());
        assert_eq!(store.inner.count(ACCESS_EVENTS), 0);

        let unlocked = engine
            .command(CommandRequest::new("D1", DoorCommand::TempUnlock { auto_lock_seconds: 1 }))
            .await
            .unwrap();
        let version = unlocked.data.version.unwrap();
        let reply = engine.relock("D1", version).await.unwrap().unwrap();
        assert_eq!(reply.data.status, DoorStatus::Locked);
        assert_eq!(store.inner.count(ACCESS_EVENTS), 2);

        let events = EventStore::new(store.clone())
            .for_door("D1", Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.notes == "Automatic re-lock after temporary unlock"));
    }

    #[tokio::test]
    async fn test_relock_skips_after_newer_temp_unlock() {
        let (engine, store, _) = engine().await;
        let temp_unlock = || CommandRequest::new("D1", DoorCommand::TempUnlock { auto_lock_seconds: 5 });

        let first = engine.command(temp_unlock()).await.unwrap().data.version.unwrap();
        let second = engine.command(temp_unlock()).await.unwrap().data.version.unwrap();

        assert!(engine.relock("D1", first).await.unwrap().is_none());
        assert_eq!(store.door("D1").await.status, DoorStatus::TempUnlocked);
        assert!(engine.relock("D1", second).await.unwrap().is_some());
        assert_eq!(store.door("D1").await.status, DoorStatus::Locked);
    }

    #[tokio::test]
    async fn test_expired_lease_status_report() {
        let (engine, store, _) = engine().await;

        let reply = engine.access_status(StatusRequest::new("T1")).await.unwrap();
        let report = reply.data;
        assert_eq!(report.access_status.status, AccessStatusKind::Expired);
        assert!(!report.access_status.is_active);
        assert!(report.accessible_doors.is_empty());
        assert!(report
            .alerts
            .iter()
            .any(|a| a.message == "Lease has expired — access should be revoked"));
        assert_eq!(report.lease_info.unwrap().days_remaining, Some(-1));
        assert_eq!(store.inner.count(AUDIT_LOG), 1);
        assert_eq!(store.inner.count(ACCESS_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_status_report_is_idempotent() {
        let (engine, store, _) = engine().await;
        engine.access_attempt(AttemptRequest::new("D1", "T2")).await.unwrap();
        engine.access_attempt(AttemptRequest::new("D3", "T2")).await.unwrap();

        let first = engine.access_status(StatusRequest::new("T2")).await.unwrap().data;
        let second = engine.access_status(StatusRequest::new("T2")).await.unwrap().data;
        assert_eq!(first.access_statistics, second.access_statistics);
        assert_eq!(first.alerts, second.alerts);
        assert_eq!(first.recent_access_events, second.recent_access_events);
        assert_eq!(first.access_statistics.total_access_attempts, 2);
        assert_eq!(first.access_statistics.success_rate, 50);

        // Active doors on P1 only: D1 and D4 (D2 is disabled, D3 is on P2)
        let ids: Vec<&str> = first.accessible_doors.iter().map(|d| d.door_id.as_str()).collect();
        assert_eq!(ids, vec!["D1", "D4"]);
        assert_eq!(first.accessible_doors[0].access_count, 1);

        // Two attempts plus two status checks
        assert_eq!(store.inner.count(AUDIT_LOG), 4);
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let (engine, store, _) = engine().await;
        let err = engine.access_status(StatusRequest::new("T404")).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert_eq!(store.inner.count(AUDIT_LOG), 0);
    }

    #[tokio::test]
    async fn test_access_attempt_decisions() {
        let (engine, store, _) = engine().await;

        let granted = engine.access_attempt(AttemptRequest::new("D1", "T2")).await.unwrap().data;
        assert!(granted.granted);
        assert_eq!(granted.result, AccessResult::Granted);

        let expired = engine.access_attempt(AttemptRequest::new("D1", "T1")).await.unwrap().data;
        assert!(!expired.granted);
        assert_eq!(expired.reason, "Access denied: Lease expired");

        let other_property = engine.access_attempt(AttemptRequest::new("D3", "T2")).await.unwrap().data;
        assert!(!other_property.granted);

        let offline = engine.access_attempt(AttemptRequest::new("D4", "T2")).await.unwrap().data;
        assert_eq!(offline.reason, "Door is offline");

        let inactive = engine.access_attempt(AttemptRequest::new("D2", "T2")).await.unwrap().data;
        assert_eq!(inactive.reason, "Door is inactive");

        assert_eq!(store.inner.count(ACCESS_EVENTS), 5);
        assert_eq!(store.inner.count(AUDIT_LOG), 5);
    }

    #[tokio::test]
    async fn test_access_attempt_unknown_door() {
        let (engine, store, _) = engine().await;
        let err = engine.access_attempt(AttemptRequest::new("D404", "T2")).await.unwrap_err();
        assert_eq!(err, EngineError::not_found("door", "D404"));
        assert_eq!(store.inner.count(ACCESS_EVENTS), 0);
    }
}
