//! Append-only audit trail over the `audit_log` collection
//!
//! A failed write is returned to the caller. It never undoes the action being
//! audited; the engine turns it into a response warning.

use crate::domain::error::EngineResult;
use crate::domain::event::AuditLogEntry;
use crate::infra::store::{encode, DocumentStore, Filter, AUDIT_LOG};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn DocumentStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Build and persist a new entry
    pub async fn record(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: &str,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<AuditLogEntry> {
        let entry = AuditLogEntry::new(action, resource_type, resource_id, details, timestamp);
        self.append(&entry).await?;
        Ok(entry)
    }

    /// Persist a prepared entry
    pub async fn append(&self, entry: &AuditLogEntry) -> EngineResult<()> {
        let result = match encode(entry) {
            Ok(data) => self.store.create(AUDIT_LOG, data).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                info!(
                    audit_id = %entry.id,
                    action = %entry.action,
                    resource_type = %entry.resource_type,
                    resource_id = %entry.resource_id,
                    "audit_recorded"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    action = %entry.action,
                    resource_id = %entry.resource_id,
                    error = %e,
                    "audit_write_failed"
                );
                Err(e.into())
            }
        }
    }

    /// Entries for one resource, oldest first
    pub async fn entries_for(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> EngineResult<Vec<AuditLogEntry>> {
        let filter =
            Filter::new().eq("resource_type", resource_type).eq("resource_id", resource_id);
        let docs = self.store.list(AUDIT_LOG, &filter).await?;
        let mut entries = Vec::with_capacity(docs.len());
        for doc in &docs {
            entries.push(doc.decode::<AuditLogEntry>()?);
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }
}
