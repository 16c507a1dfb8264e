use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::isolation::SandboxPolicy;
use crate::permissions::PermissionPolicy;
use crate::scan::ScanPolicy;

/// Everything the orchestrator needs to know about a tenant's rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantPolicy {
    pub scan: ScanPolicy,
    pub sandbox: SandboxPolicy,
    pub permissions: PermissionPolicy,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Effective policy; platform defaults when the tenant has no override
    async fn policy_for(&self, tenant_id: Uuid) -> Result<TenantPolicy>;
}

/// In-memory policy store for testing and development
pub struct InMemoryPolicyStore {
    defaults: TenantPolicy,
    overrides: Arc<DashMap<Uuid, TenantPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new(defaults: TenantPolicy) -> Self {
        Self {
            defaults,
            overrides: Arc::new(DashMap::new()),
        }
    }

    pub fn set_policy(&self, tenant_id: Uuid, policy: TenantPolicy) {
        self.overrides.insert(tenant_id, policy);
    }

    pub fn defaults(&self) -> &TenantPolicy {
        &self.defaults
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new(TenantPolicy::default())
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn policy_for(&self, tenant_id: Uuid) -> Result<TenantPolicy> {
        Ok(self
            .overrides
            .get(&tenant_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.defaults.clone()))
    }
}
