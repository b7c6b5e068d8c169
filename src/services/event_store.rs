//! Access event persistence: append and query over the `access_events` collection

use crate::domain::error::EngineResult;
use crate::domain::event::AccessEvent;
use crate::infra::store::{encode, DocumentStore, Filter, ACCESS_EVENTS};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct EventStore {
    store: Arc<dyn DocumentStore>,
}

impl EventStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persist a new event. Events are never updated afterwards.
    pub async fn append(&self, event: &AccessEvent) -> EngineResult<()> {
        self.store.create(ACCESS_EVENTS, encode(event)?).await?;
        debug!(
            event_id = %event.id,
            door_id = %event.door_id,
            event_type = %event.event_type.as_str(),
            result = %event.result.as_str(),
            "access_event_recorded"
        );
        Ok(())
    }

    pub async fn for_tenant(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<AccessEvent>> {
        self.query(Filter::new().eq("tenant_id", tenant_id).since("timestamp", since)).await
    }

    pub async fn for_door(&self, door_id: &str, since: DateTime<Utc>) -> EngineResult<Vec<AccessEvent>> {
        self.query(Filter::new().eq("door_id", door_id).since("timestamp", since)).await
    }

    async fn query(&self, filter: Filter) -> EngineResult<Vec<AccessEvent>> {
        let docs = self.store.list(ACCESS_EVENTS, &filter).await?;
        let mut events = Vec::with_capacity(docs.len());
        for doc in &docs {
            events.push(doc.decode()?);
        }
        Ok(events)
    }
}
