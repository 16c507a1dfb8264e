//! Sandbox management
//!
//! The [`SandboxManager`] provisions, monitors and tears down isolated
//! execution contexts. The isolation technology lives behind
//! [`SandboxBackend`]; one backend is registered per [`IsolationLevel`] and
//! the manager never picks a level itself.
//!
//! Every live sandbox gets its own sampling task. A sample above the
//! handle's limits bumps its violation counter; once the counter reaches the
//! configured threshold a [`ResourceViolation`] is broadcast exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ResourceError, Result};
use crate::model::ModuleId;
use crate::permissions::PermissionRequest;

/// Isolation strength, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// No isolation; trusted code only
    None,
    /// Separate OS process with OS resource controls
    Process,
    /// Namespace and cgroup isolation with network/filesystem restriction
    Container,
    /// Capability-based virtual machine
    SandboxedRuntime,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 4] = [Self::None, Self::Process, Self::Container, Self::SandboxedRuntime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Process => "process",
            Self::Container => "container",
            Self::SandboxedRuntime => "sandboxed_runtime",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits enforced on a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU budget in millicores
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub egress_bytes_per_sec: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_millis: 1_000,
            memory_bytes: 256 * 1024 * 1024, // 256MB
            egress_bytes_per_sec: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    /// Lower every limit to at most the ceiling's
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> Self {
        Self {
            cpu_millis: self.cpu_millis.min(ceiling.cpu_millis),
            memory_bytes: self.memory_bytes.min(ceiling.memory_bytes),
            egress_bytes_per_sec: self.egress_bytes_per_sec.min(ceiling.egress_bytes_per_sec),
        }
    }

    /// Limits the sample exceeds
    pub fn exceeded_by(&self, usage: &UsageSnapshot) -> Vec<LimitKind> {
        let mut exceeded = Vec::new();
        if usage.cpu_millis > self.cpu_millis {
            exceeded.push(LimitKind::Cpu);
        }
        if usage.memory_bytes > self.memory_bytes {
            exceeded.push(LimitKind::Memory);
        }
        if usage.egress_bytes_per_sec > self.egress_bytes_per_sec {
            exceeded.push(LimitKind::Egress);
        }
        exceeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Cpu,
    Memory,
    Egress,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Egress => "egress",
        })
    }
}

/// Point-in-time resource usage of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub egress_bytes_per_sec: u64,
    pub sampled_at: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn new(cpu_millis: u64, memory_bytes: u64, egress_bytes_per_sec: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            egress_bytes_per_sec,
            sampled_at: Utc::now(),
        }
    }

    pub fn idle() -> Self {
        Self::new(0, 0, 0)
    }
}

/// A live isolated execution context, owned by one installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: Uuid,
    pub installation_id: Uuid,
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    pub isolation_level: IsolationLevel,
    pub limits: ResourceLimits,
    /// Granted capabilities the sandbox was configured with
    pub capabilities: Vec<PermissionRequest>,
    /// Backend-specific reference
    pub backend_ref: String,
    /// Idempotency key the sandbox was provisioned under
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// Everything a backend needs to build a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Stable key; provisioning the same key twice yields one sandbox
    pub key: String,
    pub installation_id: Uuid,
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    pub level: IsolationLevel,
    pub limits: ResourceLimits,
    pub capabilities: Vec<PermissionRequest>,
}

/// Live state tracked for a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub handle: SandboxHandle,
    pub usage: Option<UsageSnapshot>,
    pub violations: u32,
}

/// Raised once a sandbox's violation count reaches the threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceViolation {
    pub handle: SandboxHandle,
    pub exceeded: Vec<LimitKind>,
    pub usage: UsageSnapshot,
    pub violations: u32,
}

pub type BackendResult<T> = std::result::Result<T, ResourceError>;

/// One isolation technology
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn level(&self) -> IsolationLevel;

    /// Build the sandbox and return the backend reference.
    /// Provisioning a key that already has a sandbox returns its reference.
    async fn provision(&self, request: &SandboxRequest) -> BackendResult<String>;

    /// Tear down; unknown references are a no-op
    async fn destroy(&self, backend_ref: &str) -> BackendResult<()>;

    /// Current usage, `None` when the sandbox no longer exists
    async fn sample(&self, backend_ref: &str) -> BackendResult<Option<UsageSnapshot>>;

    /// Limits the backend makes the OS enforce. The rest are only watched
    /// through sampling and the violation threshold.
    fn enforced_limits(&self) -> &'static [LimitKind] {
        &[]
    }
}

/// Sandbox manager configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Zero disables the per-handle sampling task
    pub sampling_interval: Duration,
    pub violation_threshold: u32,
    pub provision_attempts: u32,
    pub provision_backoff: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(5),
            violation_threshold: 3,
            provision_attempts: 3,
            provision_backoff: Duration::from_millis(100),
        }
    }
}

struct LiveSandbox {
    handle: SandboxHandle,
    usage: Option<UsageSnapshot>,
    violations: u32,
    raised: bool,
    monitor: Option<JoinHandle<()>>,
}

struct ManagerInner {
    backends: HashMap<IsolationLevel, Arc<dyn SandboxBackend>>,
    live: DashMap<Uuid, LiveSandbox>,
    by_key: DashMap<String, Uuid>,
    config: SandboxConfig,
    events: broadcast::Sender<ResourceViolation>,
}

/// Provisions and monitors sandboxes across every registered backend
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

pub struct SandboxManagerBuilder {
    backends: HashMap<IsolationLevel, Arc<dyn SandboxBackend>>,
    config: SandboxConfig,
}

impl SandboxManagerBuilder {
    /// Register a backend for the level it reports
    pub fn backend(mut self, backend: Arc<dyn SandboxBackend>) -> Self {
        self.backends.insert(backend.level(), backend);
        self
    }

    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SandboxManager {
        let (events, _) = broadcast::channel(256);
        SandboxManager {
            inner: Arc::new(ManagerInner {
                backends: self.backends,
                live: DashMap::new(),
                by_key: DashMap::new(),
                config: self.config,
                events,
            }),
        }
    }
}

impl SandboxManager {
    pub fn builder() -> SandboxManagerBuilder {
        SandboxManagerBuilder {
            backends: HashMap::new(),
            config: SandboxConfig::default(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Levels with a registered backend
    pub fn supported_levels(&self) -> Vec<IsolationLevel> {
        let mut levels: Vec<_> = self.inner.backends.keys().copied().collect();
        levels.sort();
        levels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceViolation> {
        self.inner.events.subscribe()
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.len()
    }

    pub fn is_live(&self, handle_id: Uuid) -> bool {
        self.inner.live.contains_key(&handle_id)
    }

    pub fn status(&self, handle_id: Uuid) -> Option<SandboxStatus> {
        self.inner.live.get(&handle_id).map(|live| SandboxStatus {
            handle: live.handle.clone(),
            usage: live.usage,
            violations: live.violations,
        })
    }

    fn backend(&self, level: IsolationLevel) -> Result<&Arc<dyn SandboxBackend>> {
        self.inner
            .backends
            .get(&level)
            .ok_or_else(|| ResourceError::BackendMissing(level).into())
    }

    /// Provision a sandbox for `request`
    ///
    /// Idempotent by `request.key`: a live sandbox under the same key is
    /// returned as is. Backend failures are retried up to the configured
    /// attempt count.
    ///
    /// # Errors
    ///
    /// `BackendMissing` when no backend serves the level,
    /// `ProvisioningFailed` once the attempts are used up.
    pub async fn provision(&self, request: SandboxRequest) -> Result<SandboxHandle> {
        if let Some(existing) = self.find_by_key(&request.key) {
            debug!(key = %request.key, sandbox = %existing.id, "Sandbox already provisioned");
            return Ok(existing);
        }

        let backend = Arc::clone(self.backend(request.level)?);
        let attempts = self.inner.config.provision_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match backend.provision(&request).await {
                Ok(backend_ref) => {
                    let handle = SandboxHandle {
                        id: Uuid::new_v4(),
                        installation_id: request.installation_id,
                        tenant_id: request.tenant_id,
                        module_id: request.module_id.clone(),
                        isolation_level: request.level,
                        limits: request.limits,
                        capabilities: request.capabilities.clone(),
                        backend_ref,
                        key: request.key.clone(),
                        created_at: Utc::now(),
                    };
                    self.track(handle.clone());
                    counter!("modhost_sandboxes_provisioned_total", "level" => request.level.as_str()).increment(1);
                    info!(
                        sandbox = %handle.id,
                        module = %handle.module_id,
                        level = %handle.isolation_level,
                        attempt = attempt,
                        enforced = ?backend.enforced_limits(),
                        "Sandbox provisioned"
                    );
                    return Ok(handle);
                }
                Err(error) => {
                    warn!(key = %request.key, attempt = attempt, error = %error, "Sandbox provisioning failed");
                    reason = error.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.provision_backoff * attempt).await;
                    }
                }
            }
        }

        Err(ResourceError::ProvisioningFailed {
            level: request.level,
            attempts,
            reason,
        }
        .into())
    }

    /// Destroy a sandbox; destroying twice is a no-op
    ///
    /// # Errors
    ///
    /// Backend errors while tearing down.
    pub async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let was_live = self.untrack(handle);
        self.backend(handle.isolation_level)?
            .destroy(&handle.backend_ref)
            .await?;

        if was_live {
            counter!("modhost_sandboxes_destroyed_total", "level" => handle.isolation_level.as_str()).increment(1);
            info!(sandbox = %handle.id, module = %handle.module_id, "Sandbox destroyed");
        }
        Ok(())
    }

    /// Sample a handle's usage; `None` once the handle is gone
    ///
    /// # Errors
    ///
    /// Backend errors while sampling.
    pub async fn sample_usage(&self, handle: &SandboxHandle) -> Result<Option<UsageSnapshot>> {
        if !self.is_live(handle.id) {
            return Ok(None);
        }
        let usage = self
            .backend(handle.isolation_level)?
            .sample(&handle.backend_ref)
            .await?;
        if let Some(usage) = usage {
            self.record_usage(handle.id, usage);
        }
        Ok(usage)
    }

    /// Account a usage sample against the handle's limits
    pub fn record_usage(&self, handle_id: Uuid, usage: UsageSnapshot) -> Option<ResourceViolation> {
        let threshold = self.inner.config.violation_threshold.max(1);

        let violation = {
            let mut live = self.inner.live.get_mut(&handle_id)?;
            live.usage = Some(usage);
            let exceeded = live.handle.limits.exceeded_by(&usage);
            if exceeded.is_empty() {
                return None;
            }
            live.violations += 1;
            warn!(
                sandbox = %handle_id,
                module = %live.handle.module_id,
                exceeded = ?exceeded,
                violations = live.violations,
                "Sandbox exceeded its limits"
            );
            if live.violations < threshold || live.raised {
                return None;
            }
            live.raised = true;
            ResourceViolation {
                handle: live.handle.clone(),
                exceeded,
                usage,
                violations: live.violations,
            }
        };

        counter!("modhost_resource_violations_total", "level" => violation.handle.isolation_level.as_str())
            .increment(1);
        // No subscribers is fine; the counter still records it
        let _ = self.inner.events.send(violation.clone());
        Some(violation)
    }

    /// Track a handle that survived a restart
    pub fn adopt(&self, handle: SandboxHandle) {
        if !self.is_live(handle.id) {
            debug!(sandbox = %handle.id, "Adopting sandbox");
            self.track(handle);
        }
    }

    fn find_by_key(&self, key: &str) -> Option<SandboxHandle> {
        let id = *self.inner.by_key.get(key)?;
        self.inner.live.get(&id).map(|live| live.handle.clone())
    }

    fn track(&self, handle: SandboxHandle) {
        let monitor = self.spawn_monitor(handle.clone());
        self.inner.by_key.insert(handle.key.clone(), handle.id);
        self.inner.live.insert(
            handle.id,
            LiveSandbox {
                handle,
                usage: None,
                violations: 0,
                raised: false,
                monitor,
            },
        );
    }

    fn untrack(&self, handle: &SandboxHandle) -> bool {
        self.inner.by_key.remove_if(&handle.key, |_, id| *id == handle.id);
        match self.inner.live.remove(&handle.id) {
            Some((_, live)) => {
                if let Some(monitor) = live.monitor {
                    monitor.abort();
                }
                true
            }
            None => false,
        }
    }

    fn spawn_monitor(&self, handle: SandboxHandle) -> Option<JoinHandle<()>> {
        let interval = self.inner.config.sampling_interval;
        if interval.is_zero() {
            return None;
        }
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let manager = SandboxManager { inner };
                match manager.sample_usage(&handle).await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(error) => {
                        warn!(sandbox = %handle.id, error = %error, "Usage sampling failed");
                    }
                }
            }
            debug!(sandbox = %handle.id, "Sampling stopped");
        }))
    }
}

/// In-memory backend for testing and development
pub struct InMemoryBackend {
    level: IsolationLevel,
    capacity: Option<usize>,
    live: DashMap<String, UsageSnapshot>,
    by_key: DashMap<String, String>,
    failures: AtomicU32,
    provisioned: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(level: IsolationLevel) -> Self {
        Self {
            level,
            capacity: None,
            live: DashMap::new(),
            by_key: DashMap::new(),
            failures: AtomicU32::new(0),
            provisioned: AtomicU64::new(0),
        }
    }

    /// Refuse provisioning beyond `capacity` live sandboxes
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Fail the next `count` provision calls
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn set_usage(&self, backend_ref: &str, usage: UsageSnapshot) {
        if let Some(mut entry) = self.live.get_mut(backend_ref) {
            *entry = usage;
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Sandboxes ever created, duplicates included
    pub fn provisioned_total(&self) -> u64 {
        self.provisioned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBackend for InMemoryBackend {
    fn level(&self) -> IsolationLevel {
        self.level
    }

    async fn provision(&self, request: &SandboxRequest) -> BackendResult<String> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(ResourceError::Backend("injected provisioning failure".to_string()));
        }

        if let Some(existing) = self.by_key.get(&request.key) {
            if self.live.contains_key(existing.value()) {
                return Ok(existing.value().clone());
            }
        }
        if self.capacity.is_some_and(|capacity| self.live.len() >= capacity) {
            return Err(ResourceError::Backend(format!("{} capacity exhausted", self.level)));
        }

        let backend_ref = format!("{}-{}", self.level, Uuid::new_v4());
        self.live.insert(backend_ref.clone(), UsageSnapshot::idle());
        self.by_key.insert(request.key.clone(), backend_ref.clone());
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(backend_ref)
    }

    async fn destroy(&self, backend_ref: &str) -> BackendResult<()> {
        self.live.remove(backend_ref);
        self.by_key.retain(|_, value| value != backend_ref);
        Ok(())
    }

    async fn sample(&self, backend_ref: &str) -> BackendResult<Option<UsageSnapshot>> {
        Ok(self.live.get(backend_ref).map(|usage| UsageSnapshot {
            sampled_at: Utc::now(),
            ..*usage
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;

    fn request(key: &str, level: IsolationLevel) -> SandboxRequest {
        SandboxRequest {
            key: key.to_string(),
            installation_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            module_id: ModuleId::from("reports"),
            level,
            limits: ResourceLimits::default(),
            capabilities: Vec::new(),
        }
    }

    fn manager(backend: Arc<InMemoryBackend>, config: SandboxConfig) -> SandboxManager {
        SandboxManager::builder().backend(backend).config(config).build()
    }

    fn quiet() -> SandboxConfig {
        SandboxConfig {
            sampling_interval: Duration::ZERO,
            violation_threshold: 2,
            provision_attempts: 2,
            provision_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_per_key() {
        let backend = Arc::new(InMemoryBackend::new(IsolationLevel::Process));
        let manager = manager(Arc::clone(&backend), quiet());

        let first = manager.provision(request("op/reports", IsolationLevel::Process)).await.unwrap();
        let second = manager.provision(request("op/reports", IsolationLevel::Process)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(backend.live_count(), 1);
        assert_eq!(backend.provisioned_total(), 1);
    }

    #[tokio::test]
    async fn test_destroy_twice_is_noop() {
        let backend = Arc::new(InMemoryBackend::new(IsolationLevel::Process));
        let manager = manager(Arc::clone(&backend), quiet());
        let handle = manager.provision(request("k", IsolationLevel::Process)).await.unwrap();

        manager.destroy(&handle).await.unwrap();
        manager.destroy(&handle).await.unwrap();
        assert_eq!(backend.live_count(), 0);
        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.sample_usage(&handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_provision_retries_then_fails() {
        let backend = Arc::new(InMemoryBackend::new(IsolationLevel::Container));
        let manager = manager(Arc::clone(&backend), quiet());

        backend.fail_next(1);
        assert!(manager.provision(request("a", IsolationLevel::Container)).await.is_ok());

        backend.fail_next(5);
        let error = manager
            .provision(request("b", IsolationLevel::Container))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            LifecycleError::Resource(ResourceError::ProvisioningFailed { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_backend() {
        let manager = manager(Arc::new(InMemoryBackend::new(IsolationLevel::Process)), quiet());
        let error = manager
            .provision(request("a", IsolationLevel::SandboxedRuntime))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            LifecycleError::Resource(ResourceError::BackendMissing(IsolationLevel::SandboxedRuntime))
        ));
    }

    #[tokio::test]
    async fn test_violation_raised_once_at_threshold() {
        let backend = Arc::new(InMemoryBackend::new(IsolationLevel::Process));
        let manager = manager(Arc::clone(&backend), quiet());
        let mut events = manager.subscribe();
        let handle = manager.provision(request("k", IsolationLevel::Process)).await.unwrap();

        let hot = UsageSnapshot::new(0, handle.limits.memory_bytes + 1, 0);
        backend.set_usage(&handle.backend_ref, hot);

        assert!(manager.sample_usage(&handle).await.unwrap().is_some());
        assert!(events.try_recv().is_err());

        manager.sample_usage(&handle).await.unwrap();
        let violation = events.try_recv().unwrap();
        assert_eq!(violation.exceeded, vec![LimitKind::Memory]);
        assert_eq!(violation.violations, 2);

        manager.sample_usage(&handle).await.unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(manager.status(handle.id).unwrap().violations, 3);
    }

    #[tokio::test]
    async fn test_monitor_samples_in_background() {
        let backend = Arc::new(InMemoryBackend::new(IsolationLevel::Process));
        let config = SandboxConfig {
            sampling_interval: Duration::from_millis(10),
            violation_threshold: 1,
            ..quiet()
        };
        let manager = manager(Arc::clone(&backend), config);
        let mut events = manager.subscribe();
        let handle = manager.provision(request("k", IsolationLevel::Process)).await.unwrap();
        backend.set_usage(&handle.backend_ref, UsageSnapshot::new(handle.limits.cpu_millis + 5, 0, 0));

        let violation = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(violation.handle.id, handle.id);
        assert_eq!(violation.exceeded, vec![LimitKind::Cpu]);

        manager.destroy(&handle).await.unwrap();
    }

    #[test]
    fn test_clamp_to_ceiling() {
        let requested = ResourceLimits {
            cpu_millis: 4_000,
            memory_bytes: 1024,
            egress_bytes_per_sec: 10,
        };
        let ceiling = ResourceLimits {
            cpu_millis: 2_000,
            memory_bytes: 4096,
            egress_bytes_per_sec: 5,
        };
        let clamped = requested.clamp_to(&ceiling);
        assert_eq!(clamped.cpu_millis, 2_000);
        assert_eq!(clamped.memory_bytes, 1024);
        assert_eq!(clamped.egress_bytes_per_sec, 5);
    }
}
