//! Permission enforcement
//!
//! Validates a version's requested capabilities against tenant policy and
//! records the resulting grants. Under the default all-or-nothing mode one
//! denied permission rejects the whole request; in partial mode denied
//! permissions are kept as explicit `granted: false` grants so the sandbox
//! gets a reduced capability set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::model::ModuleId;

/// Capability a module can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    FileSystemRead,
    FileSystemWrite,
    NetworkEgress,
    DatabaseAccess,
    EventPublish,
    EventSubscribe,
    SecretRead,
    ExternalApi,
}

impl PermissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileSystemRead => "file_system_read",
            Self::FileSystemWrite => "file_system_write",
            Self::NetworkEgress => "network_egress",
            Self::DatabaseAccess => "database_access",
            Self::EventPublish => "event_publish",
            Self::EventSubscribe => "event_subscribe",
            Self::SecretRead => "secret_read",
            Self::ExternalApi => "external_api",
        }
    }
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared capability request
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub permission_type: PermissionType,
    pub resource: String,
}

impl PermissionRequest {
    pub fn new(permission_type: PermissionType, resource: impl Into<String>) -> Self {
        Self {
            permission_type,
            resource: resource.into(),
        }
    }
}

impl fmt::Display for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.permission_type, self.resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GrantMode {
    #[default]
    AllOrNothing,
    AllowPartial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Allow,
    Deny,
}

/// Policy rule; `resource` is a glob pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// `None` matches every permission type
    #[serde(default)]
    pub permission_type: Option<PermissionType>,
    pub resource: String,
    pub effect: RuleEffect,
}

impl PermissionRule {
    pub fn allow(permission_type: Option<PermissionType>, resource: impl Into<String>) -> Self {
        Self {
            permission_type,
            resource: resource.into(),
            effect: RuleEffect::Allow,
        }
    }

    pub fn deny(permission_type: Option<PermissionType>, resource: impl Into<String>) -> Self {
        Self {
            permission_type,
            resource: resource.into(),
            effect: RuleEffect::Deny,
        }
    }

    fn matches(&self, request: &PermissionRequest) -> bool {
        if self
            .permission_type
            .is_some_and(|permission_type| permission_type != request.permission_type)
        {
            return false;
        }
        match glob::Pattern::new(&self.resource) {
            Ok(pattern) => pattern.matches(&request.resource),
            Err(error) => {
                warn!(pattern = %self.resource, error = %error, "Ignoring invalid permission pattern");
                false
            }
        }
    }
}

/// Tenant permission policy; anything no rule allows is denied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PermissionPolicy {
    pub mode: GrantMode,
    pub rules: Vec<PermissionRule>,
}

impl PermissionPolicy {
    /// Allow every request
    pub fn permissive() -> Self {
        Self {
            mode: GrantMode::AllOrNothing,
            rules: vec![PermissionRule::allow(None, "*")],
        }
    }

    pub fn with_mode(mut self, mode: GrantMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_rule(mut self, rule: PermissionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Deny rules win over allow rules
    pub fn permits(&self, request: &PermissionRequest) -> bool {
        let mut allowed = false;
        for rule in self.rules.iter().filter(|rule| rule.matches(request)) {
            match rule.effect {
                RuleEffect::Deny => return false,
                RuleEffect::Allow => allowed = true,
            }
        }
        allowed
    }
}

/// A recorded authorization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub module_id: ModuleId,
    pub tenant_id: Uuid,
    pub permission_type: PermissionType,
    pub resource: String,
    pub granted: bool,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

impl PermissionGrant {
    fn key(&self) -> (PermissionType, String) {
        (self.permission_type, self.resource.clone())
    }

    pub fn request(&self) -> PermissionRequest {
        PermissionRequest::new(self.permission_type, self.resource.clone())
    }
}

/// Requests that ended up granted, for sandbox configuration
pub fn capability_set(grants: &[PermissionGrant]) -> Vec<PermissionRequest> {
    grants
        .iter()
        .filter(|grant| grant.granted)
        .map(PermissionGrant::request)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct PermissionEnforcer;

impl PermissionEnforcer {
    pub fn new() -> Self {
        Self
    }

    /// Decide every requested permission under `policy`
    ///
    /// # Errors
    ///
    /// `PermissionDenied` listing the denied permissions when the policy is
    /// all-or-nothing and anything was denied.
    pub fn authorize(
        &self,
        tenant_id: Uuid,
        module_id: &ModuleId,
        requested: &[PermissionRequest],
        policy: &PermissionPolicy,
        granted_by: &str,
    ) -> Result<Vec<PermissionGrant>> {
        let unique: BTreeSet<&PermissionRequest> = requested.iter().collect();
        let now = Utc::now();

        let grants: Vec<PermissionGrant> = unique
            .into_iter()
            .map(|request| PermissionGrant {
                module_id: module_id.clone(),
                tenant_id,
                permission_type: request.permission_type,
                resource: request.resource.clone(),
                granted: policy.permits(request),
                granted_by: granted_by.to_string(),
                granted_at: now,
            })
            .collect();

        let denied: Vec<String> = grants
            .iter()
            .filter(|grant| !grant.granted)
            .map(|grant| grant.request().to_string())
            .collect();

        if !denied.is_empty() && policy.mode == GrantMode::AllOrNothing {
            return Err(LifecycleError::PermissionDenied {
                module_id: module_id.clone(),
                denied,
            });
        }
        if !denied.is_empty() {
            warn!(module = %module_id, denied = ?denied, "Granting reduced capability set");
        }
        Ok(grants)
    }
}

/// What a grant write changed, enough to undo it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantChange {
    /// Grants that did not exist before
    pub created: Vec<PermissionGrant>,
    /// Previous values of grants that were overwritten or removed
    pub replaced: Vec<PermissionGrant>,
}

impl GrantChange {
    /// Difference between the grant set before a write and the set written
    ///
    /// Computed from a snapshot taken ahead of the write, so a write that is
    /// retried or replayed still undoes to the original set.
    pub fn between(prior: &[PermissionGrant], incoming: &[PermissionGrant]) -> Self {
        let before: BTreeMap<_, _> = prior.iter().map(|grant| (grant.key(), grant)).collect();
        let after: BTreeMap<_, _> = incoming.iter().map(|grant| (grant.key(), grant)).collect();

        let created = after
            .iter()
            .filter(|(key, grant)| before.get(*key).map_or(true, |old| old.granted != grant.granted))
            .map(|(_, grant)| (*grant).clone())
            .collect();
        let replaced = before
            .iter()
            .filter(|(key, old)| after.get(*key).map_or(true, |grant| grant.granted != old.granted))
            .map(|(_, old)| (*old).clone())
            .collect();

        Self { created, replaced }
    }

    /// Undo information for revoking every grant in `prior`
    pub fn revoked(prior: Vec<PermissionGrant>) -> Self {
        Self {
            created: Vec::new(),
            replaced: prior,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.replaced.is_empty()
    }
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Make `grants` the module's complete grant set. Idempotent: writing
    /// the same set twice leaves the store as one write does.
    async fn replace_all(&self, tenant_id: Uuid, module_id: &ModuleId, grants: Vec<PermissionGrant>) -> Result<()>;

    async fn list(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<Vec<PermissionGrant>>;

    /// Remove every grant of the module
    async fn revoke_all(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<()>;

    /// Undo a change: drop created grants, reinstate replaced ones
    async fn restore(&self, change: &GrantChange) -> Result<()>;
}

type GrantSet = BTreeMap<(PermissionType, String), PermissionGrant>;

/// In-memory grant store for testing and development
pub struct InMemoryGrantStore {
    grants: Arc<DashMap<(Uuid, ModuleId), GrantSet>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self {
            grants: Arc::new(DashMap::new()),
        }
    }

    /// Total grants across tenants
    pub fn count(&self) -> usize {
        self.grants.iter().map(|entry| entry.value().len()).sum()
    }
}

impl Default for InMemoryGrantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn replace_all(&self, tenant_id: Uuid, module_id: &ModuleId, grants: Vec<PermissionGrant>) -> Result<()> {
        let mut entry = self.grants.entry((tenant_id, module_id.clone())).or_default();
        let existing = entry.value_mut();
        let incoming: GrantSet = grants.into_iter().map(|grant| (grant.key(), grant)).collect();

        existing.retain(|key, _| incoming.contains_key(key));
        let mut written = 0usize;
        for (key, grant) in incoming {
            match existing.get(&key) {
                // Unchanged decision keeps the original grant time
                Some(old) if old.granted == grant.granted => {}
                _ => {
                    existing.insert(key, grant);
                    written += 1;
                }
            }
        }

        debug!(
            tenant_id = %tenant_id,
            module = %module_id,
            total = existing.len(),
            written = written,
            "Grants written"
        );
        Ok(())
    }

    async fn list(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<Vec<PermissionGrant>> {
        Ok(self
            .grants
            .get(&(tenant_id, module_id.clone()))
            .map(|entry| entry.value().values().cloned().collect())
            .unwrap_or_default())
    }

    async fn revoke_all(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<()> {
        self.grants.remove(&(tenant_id, module_id.clone()));
        Ok(())
    }

    async fn restore(&self, change: &GrantChange) -> Result<()> {
        for grant in &change.created {
            if let Some(mut set) = self.grants.get_mut(&(grant.tenant_id, grant.module_id.clone())) {
                set.remove(&grant.key());
            }
        }
        for grant in &change.replaced {
            self.grants
                .entry((grant.tenant_id, grant.module_id.clone()))
                .or_default()
                .insert(grant.key(), grant.clone());
        }
        self.grants.retain(|_, set| !set.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requests() -> Vec<PermissionRequest> {
        vec![
            PermissionRequest::new(PermissionType::NetworkEgress, "api.stripe.com"),
            PermissionRequest::new(PermissionType::SecretRead, "payments/*"),
        ]
    }

    fn policy() -> PermissionPolicy {
        PermissionPolicy::default()
            .with_rule(PermissionRule::allow(Some(PermissionType::NetworkEgress), "*.stripe.com"))
            .with_rule(PermissionRule::allow(Some(PermissionType::SecretRead), "payments/*"))
    }

    #[test]
    fn test_all_granted() {
        let tenant = Uuid::new_v4();
        let grants = PermissionEnforcer::new()
            .authorize(tenant, &ModuleId::from("pay"), &requests(), &policy(), "op")
            .unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|grant| grant.granted));
    }

    #[test]
    fn test_all_or_nothing_denies_whole_request() {
        let policy = policy().with_rule(PermissionRule::deny(Some(PermissionType::SecretRead), "*"));
        let error = PermissionEnforcer::new()
            .authorize(Uuid::new_v4(), &ModuleId::from("pay"), &requests(), &policy, "op")
            .unwrap_err();
        match error {
            LifecycleError::PermissionDenied { denied, .. } => {
                assert_eq!(denied, vec!["secret_read:payments/*".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_mode_marks_denied_grants() {
        let policy = PermissionPolicy::default()
            .with_mode(GrantMode::AllowPartial)
            .with_rule(PermissionRule::allow(Some(PermissionType::NetworkEgress), "*"));
        let grants = PermissionEnforcer::new()
            .authorize(Uuid::new_v4(), &ModuleId::from("pay"), &requests(), &policy, "op")
            .unwrap();

        assert_eq!(grants.len(), 2);
        assert_eq!(capability_set(&grants).len(), 1);
        assert!(grants
            .iter()
            .any(|grant| grant.permission_type == PermissionType::SecretRead && !grant.granted));
    }

    #[test]
    fn test_default_policy_denies() {
        let request = PermissionRequest::new(PermissionType::DatabaseAccess, "main");
        assert!(!PermissionPolicy::default().permits(&request));
        assert!(PermissionPolicy::permissive().permits(&request));
    }

    #[tokio::test]
    async fn test_replace_and_restore() {
        let store = InMemoryGrantStore::new();
        let tenant = Uuid::new_v4();
        let module = ModuleId::from("pay");
        let enforcer = PermissionEnforcer::new();

        let first = enforcer
            .authorize(tenant, &module, &requests(), &policy(), "op-1")
            .unwrap();
        store.replace_all(tenant, &module, first).await.unwrap();
        assert_eq!(store.count(), 2);

        // Second operation narrows the grant set
        let prior = store.list(tenant, &module).await.unwrap();
        let narrowed = enforcer
            .authorize(tenant, &module, &requests()[..1], &policy(), "op-2")
            .unwrap();
        let change = GrantChange::between(&prior, &narrowed);
        store.replace_all(tenant, &module, narrowed).await.unwrap();
        assert_eq!(change.created.len(), 0);
        assert_eq!(change.replaced.len(), 1);
        assert_eq!(store.count(), 1);

        store.restore(&change).await.unwrap();
        assert_eq!(store.list(tenant, &module).await.unwrap(), prior);
    }

    #[tokio::test]
    async fn test_repeated_write_still_restores_prior_set() {
        let store = InMemoryGrantStore::new();
        let tenant = Uuid::new_v4();
        let module = ModuleId::from("pay");
        let enforcer = PermissionEnforcer::new();

        let original = enforcer
            .authorize(tenant, &module, &requests(), &policy(), "op-1")
            .unwrap();
        store.replace_all(tenant, &module, original).await.unwrap();
        let prior = store.list(tenant, &module).await.unwrap();

        // A write that landed but whose result was lost gets written again
        let narrowed = enforcer
            .authorize(tenant, &module, &requests()[1..], &policy(), "op-2")
            .unwrap();
        store.replace_all(tenant, &module, narrowed.clone()).await.unwrap();
        store.replace_all(tenant, &module, narrowed.clone()).await.unwrap();
        assert_eq!(store.count(), 1);

        store.restore(&GrantChange::between(&prior, &narrowed)).await.unwrap();
        assert_eq!(store.list(tenant, &module).await.unwrap(), prior);
    }

    #[tokio::test]
    async fn test_fresh_install_restores_to_nothing() {
        let store = InMemoryGrantStore::new();
        let tenant = Uuid::new_v4();
        let module = ModuleId::from("pay");
        let grants = PermissionEnforcer::new()
            .authorize(tenant, &module, &requests(), &policy(), "op-1")
            .unwrap();

        let change = GrantChange::between(&[], &grants);
        store.replace_all(tenant, &module, grants.clone()).await.unwrap();
        store.replace_all(tenant, &module, grants).await.unwrap();
        assert_eq!(change.created.len(), 2);
        assert_eq!(store.count(), 2);

        store.restore(&change).await.unwrap();
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_revoke_restores_from_snapshot() {
        let store = InMemoryGrantStore::new();
        let tenant = Uuid::new_v4();
        let module = ModuleId::from("pay");
        let grants = PermissionEnforcer::new()
            .authorize(tenant, &module, &requests(), &policy(), "op-1")
            .unwrap();
        store.replace_all(tenant, &module, grants).await.unwrap();

        let prior = store.list(tenant, &module).await.unwrap();
        store.revoke_all(tenant, &module).await.unwrap();
        store.revoke_all(tenant, &module).await.unwrap();
        assert_eq!(store.count(), 0);

        store.restore(&GrantChange::revoked(prior.clone())).await.unwrap();
        assert_eq!(store.list(tenant, &module).await.unwrap(), prior);
    }

    #[test]
    fn test_flipped_decision_is_both_created_and_replaced() {
        let tenant = Uuid::new_v4();
        let module = ModuleId::from("pay");
        let partial = PermissionPolicy::default().with_mode(GrantMode::AllowPartial);
        let denied = PermissionEnforcer::new()
            .authorize(tenant, &module, &requests()[..1], &partial, "op-1")
            .unwrap();
        let allowed = PermissionEnforcer::new()
            .authorize(tenant, &module, &requests()[..1], &policy(), "op-2")
            .unwrap();

        let change = GrantChange::between(&denied, &allowed);
        assert_eq!(change.created, allowed);
        assert_eq!(change.replaced, denied);
        assert!(GrantChange::between(&allowed, &allowed).is_empty());
    }
}
