//! Read-only tenant and lease provider

use crate::domain::error::EngineResult;
use crate::domain::tenant::{Lease, LeaseStatus, Tenant};
use crate::infra::store::{DocumentStore, Filter, LEASES, TENANTS};
use async_trait::async_trait;
use std::sync::Arc;

/// Tenant-management collaborator as seen by the engine
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> EngineResult<Option<Tenant>>;

    async fn list_active_leases(&self, tenant_id: &str) -> EngineResult<Vec<Lease>>;
}

/// Directory backed by the `tenants` and `leases` collections
pub struct StoreDirectory {
    store: Arc<dyn DocumentStore>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantDirectory for StoreDirectory {
    async fn get_tenant(&self, tenant_id: &str) -> EngineResult<Option<Tenant>> {
        match self.store.get(TENANTS, tenant_id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    async fn list_active_leases(&self, tenant_id: &str) -> EngineResult<Vec<Lease>> {
        let filter = Filter::new().eq("tenant_id", tenant_id).eq("status", "active");
        let docs = self.store.list(LEASES, &filter).await?;
        let mut leases = Vec::with_capacity(docs.len());
        for doc in &docs {
            let lease: Lease = doc.decode()?;
            if lease.status == LeaseStatus::Active {
                leases.push(lease);
            }
        }
        Ok(leases)
    }
}
