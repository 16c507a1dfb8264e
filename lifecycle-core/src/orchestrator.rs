//! Lifecycle orchestrator
//!
//! Sequences the resolver, security gate, permission enforcer and sandbox
//! manager into install, update, uninstall, activate, deactivate and resume
//! operations. Every forward step runs through the [`DurableExecutor`] under
//! a stable `(operation id, step id)` so a re-driven operation replays
//! completed steps instead of repeating their side effects.
//!
//! | Step | Forward | Compensation |
//! |------|---------|--------------|
//! | 1 | resolve plan, lock dependency rows | restore dependency rows |
//! | 2 | security gate | none |
//! | 3 | authorize permissions | restore previous grants |
//! | 4 | stage package content | unstage |
//! | 5 | provision sandbox | destroy sandbox |
//! | 6 | commit rows, then release dependency rows | restore the target row |
//!
//! A failure at step *k* runs the registered compensations newest first.
//! Compensations are retried within the compensation budget; when one is
//! exhausted the rows the operation held are marked `Failed` with the root
//! cause recorded.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use error_common::{log_error, ErrorReport};
use logger_redacted::{RedactionConfig, SecretRedactor};
use metrics::{counter, histogram};
use semver::{Version, VersionReq};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use workflow_engine::{DurableExecutor, InMemoryStepLog, StepLog, StepOptions};

use crate::api::{InstallRequest, OperationStatusView, UpdateRequest};
use crate::catalog::ModuleCatalog;
use crate::error::{ConflictError, LifecycleError, Result};
use crate::isolation::IsolationSelector;
use crate::model::{InstallationStatus, ModuleId, ModuleInstallation, ModuleVersion};
use crate::operation::{steps, Compensation, OperationKind, OperationRecord, OperationRequest, OperationStatus};
use crate::permissions::{
    capability_set, GrantChange, GrantStore, InMemoryGrantStore, PermissionEnforcer, PermissionGrant,
};
use crate::policy::{InMemoryPolicyStore, PolicyStore};
use crate::resolver::{DependencyResolver, Plan, PlanAction, ResolveRequest};
use crate::sandbox::{
    InMemoryBackend, IsolationLevel, ResourceLimits, ResourceViolation, SandboxHandle, SandboxManager, SandboxRequest,
};
use crate::scan::{GateVerdict, ScannerBackend, SecurityGate};
use crate::settings::LifecycleSettings;
use crate::storage::{verify_content, PackageStorage, StagedRef};
use crate::store::{
    Acquisition, InMemoryInstallationStore, InMemoryOperationStore, InstallationStore, OperationStore,
};

fn restore_key(module_id: &ModuleId) -> String {
    format!("restore:{module_id}")
}

fn grants_key(module_id: &ModuleId) -> String {
    format!("grants:{module_id}")
}

fn sandbox_comp_key(module_id: &ModuleId) -> String {
    format!("sandbox:{module_id}")
}

/// Idempotency key for side effects an operation creates for a module
fn effect_key(op_id: Uuid, module_id: &ModuleId) -> String {
    format!("{op_id}/{module_id}")
}

/// Row as it was before the operation took it
fn snapshot_of(record: &OperationRecord, module_id: &ModuleId) -> Option<ModuleInstallation> {
    let key = restore_key(module_id);
    record
        .compensations
        .iter()
        .find(|pending| pending.key == key)
        .and_then(|pending| match &pending.action {
            Compensation::RestoreInstallation { snapshot, .. } => snapshot.clone(),
            _ => None,
        })
}

/// After a sandbox is gone, rolling back must not resurrect it
fn rebase_snapshot(record: &mut OperationRecord) {
    let key = restore_key(&record.module_id);
    if let Some(pending) = record.compensations.iter_mut().find(|pending| pending.key == key) {
        if let Compensation::RestoreInstallation { snapshot: Some(row), .. } = &mut pending.action {
            row.sandbox = None;
            if row.status == InstallationStatus::Active {
                row.status = InstallationStatus::Inactive;
            }
        }
    }
}

/// What step 6 writes for one planned module
struct CommitChange<'a> {
    version: &'a ModuleVersion,
    staged: Option<&'a StagedRef>,
    sandbox: Option<&'a SandboxHandle>,
    request: &'a OperationRequest,
    is_target: bool,
    activate: bool,
}

struct Inner {
    catalog: Arc<dyn ModuleCatalog>,
    resolver: DependencyResolver,
    gate: SecurityGate,
    enforcer: PermissionEnforcer,
    selector: IsolationSelector,
    installations: Arc<dyn InstallationStore>,
    operations: Arc<dyn OperationStore>,
    grants: Arc<dyn GrantStore>,
    storage: Arc<dyn PackageStorage>,
    policies: Arc<dyn PolicyStore>,
    sandboxes: SandboxManager,
    executor: DurableExecutor,
    settings: LifecycleSettings,
    redactor: Option<SecretRedactor>,
    finished: Notify,
}

/// Entry point for the API layer
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    inner: Arc<Inner>,
}

pub struct LifecycleOrchestratorBuilder {
    catalog: Arc<dyn ModuleCatalog>,
    storage: Arc<dyn PackageStorage>,
    scanner: Arc<dyn ScannerBackend>,
    installations: Option<Arc<dyn InstallationStore>>,
    operations: Option<Arc<dyn OperationStore>>,
    grants: Option<Arc<dyn GrantStore>>,
    policies: Option<Arc<dyn PolicyStore>>,
    step_log: Option<Arc<dyn StepLog>>,
    sandboxes: Option<SandboxManager>,
    settings: LifecycleSettings,
}

impl LifecycleOrchestratorBuilder {
    pub fn installations(mut self, store: Arc<dyn InstallationStore>) -> Self {
        self.installations = Some(store);
        self
    }

    pub fn operations(mut self, store: Arc<dyn OperationStore>) -> Self {
        self.operations = Some(store);
        self
    }

    pub fn grants(mut self, store: Arc<dyn GrantStore>) -> Self {
        self.grants = Some(store);
        self
    }

    pub fn policies(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policies = Some(store);
        self
    }

    pub fn step_log(mut self, log: Arc<dyn StepLog>) -> Self {
        self.step_log = Some(log);
        self
    }

    pub fn sandboxes(mut self, manager: SandboxManager) -> Self {
        self.sandboxes = Some(manager);
        self
    }

    pub fn settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Missing collaborators fall back to the in-memory adapters
    ///
    /// # Errors
    ///
    /// `InvalidState` when the redactor cannot be built.
    pub fn build(self) -> Result<LifecycleOrchestrator> {
        let settings = self.settings;

        let redactor = if settings.logging.redaction_enabled {
            let config = RedactionConfig {
                hash_for_correlation: false,
                ..RedactionConfig::default()
            };
            Some(SecretRedactor::new(config).map_err(|error| LifecycleError::InvalidState(error.to_string()))?)
        } else {
            None
        };

        let sandboxes = self.sandboxes.unwrap_or_else(|| {
            IsolationLevel::ALL
                .iter()
                .fold(
                    SandboxManager::builder().config(settings.sandbox.manager_config()),
                    |builder, level| builder.backend(Arc::new(InMemoryBackend::new(*level))),
                )
                .build()
        });
        let policies = self
            .policies
            .unwrap_or_else(|| Arc::new(InMemoryPolicyStore::new(settings.tenant_defaults())));
        let step_log = self.step_log.unwrap_or_else(|| Arc::new(InMemoryStepLog::new()));

        Ok(LifecycleOrchestrator {
            inner: Arc::new(Inner {
                resolver: DependencyResolver::new(Arc::clone(&self.catalog)),
                gate: SecurityGate::new(self.scanner, Arc::clone(&self.storage)),
                catalog: self.catalog,
                enforcer: PermissionEnforcer::new(),
                selector: IsolationSelector::new(),
                installations: self
                    .installations
                    .unwrap_or_else(|| Arc::new(InMemoryInstallationStore::new())),
                operations: self
                    .operations
                    .unwrap_or_else(|| Arc::new(InMemoryOperationStore::new())),
                grants: self.grants.unwrap_or_else(|| Arc::new(InMemoryGrantStore::new())),
                storage: self.storage,
                policies,
                sandboxes,
                executor: settings.executor(step_log),
                redactor,
                settings,
                finished: Notify::new(),
            }),
        })
    }
}

impl LifecycleOrchestrator {
    pub fn builder(
        catalog: Arc<dyn ModuleCatalog>,
        storage: Arc<dyn PackageStorage>,
        scanner: Arc<dyn ScannerBackend>,
    ) -> LifecycleOrchestratorBuilder {
        LifecycleOrchestratorBuilder {
            catalog,
            storage,
            scanner,
            installations: None,
            operations: None,
            grants: None,
            policies: None,
            step_log: None,
            sandboxes: None,
            settings: LifecycleSettings::default(),
        }
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.inner.sandboxes
    }

    /// Start installing a module; returns once the row is locked
    ///
    /// # Errors
    ///
    /// `OperationInProgress` when another operation holds the module,
    /// `AlreadyInstalled` when it is installed.
    pub async fn start_install(&self, request: InstallRequest) -> Result<Uuid> {
        let (tenant_id, module_id, operation) = request.into_operation();
        self.begin(OperationRecord::new(tenant_id, module_id, operation), false)
            .await
    }

    /// # Errors
    ///
    /// Lock conflicts, see [`LifecycleOrchestrator::start_install`].
    pub async fn start_update(&self, request: UpdateRequest) -> Result<Uuid> {
        let (tenant_id, module_id, operation) = request.into_operation();
        self.begin(OperationRecord::new(tenant_id, module_id, operation), false)
            .await
    }

    /// # Errors
    ///
    /// Lock conflicts, see [`LifecycleOrchestrator::start_install`].
    pub async fn start_uninstall(&self, tenant_id: Uuid, module_id: impl Into<ModuleId>) -> Result<Uuid> {
        self.begin(
            OperationRecord::new(tenant_id, module_id.into(), OperationRequest::Uninstall),
            false,
        )
        .await
    }

    /// # Errors
    ///
    /// Lock conflicts, see [`LifecycleOrchestrator::start_install`].
    pub async fn start_activate(&self, tenant_id: Uuid, module_id: impl Into<ModuleId>) -> Result<Uuid> {
        self.begin(
            OperationRecord::new(tenant_id, module_id.into(), OperationRequest::Activate),
            false,
        )
        .await
    }

    /// # Errors
    ///
    /// Lock conflicts, see [`LifecycleOrchestrator::start_install`].
    pub async fn start_deactivate(&self, tenant_id: Uuid, module_id: impl Into<ModuleId>) -> Result<Uuid> {
        self.begin(
            OperationRecord::new(tenant_id, module_id.into(), OperationRequest::Deactivate),
            false,
        )
        .await
    }

    /// Bring a suspended installation back to `Active`
    ///
    /// # Errors
    ///
    /// Lock conflicts, see [`LifecycleOrchestrator::start_install`].
    pub async fn start_resume(&self, tenant_id: Uuid, module_id: impl Into<ModuleId>) -> Result<Uuid> {
        self.begin(
            OperationRecord::new(tenant_id, module_id.into(), OperationRequest::Resume),
            false,
        )
        .await
    }

    /// Re-issue the operation that left an installation `Failed`
    ///
    /// Compensations the failed operation could not finish are drained first.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the row is `Failed` through an operation on the
    /// module itself.
    pub async fn start_retry(&self, tenant_id: Uuid, module_id: impl Into<ModuleId>) -> Result<Uuid> {
        let module_id = module_id.into();
        let row = self
            .inner
            .installations
            .get(tenant_id, &module_id)
            .await?
            .ok_or_else(|| ConflictError::NotInstalled(module_id.clone()))?;
        if row.status != InstallationStatus::Failed {
            return Err(LifecycleError::InvalidState(format!(
                "{module_id} is {}, only failed installations can be retried",
                row.status
            )));
        }

        let previous_id = row
            .last_operation
            .ok_or_else(|| LifecycleError::InvalidState(format!("{module_id} has no operation to retry")))?;
        let previous = self
            .inner
            .operations
            .get(previous_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {previous_id}")))?;
        if previous.module_id != module_id {
            return Err(LifecycleError::InvalidState(format!(
                "{module_id} failed as a dependency of {}; retry that module instead",
                previous.module_id
            )));
        }

        let mut record = OperationRecord::new(tenant_id, module_id, previous.request);
        record.retry_of = Some(previous_id);
        self.begin(record, true).await
    }

    /// Ask an install or update to stop at its next step boundary
    ///
    /// # Errors
    ///
    /// `InvalidState` once the operation reached its commit step or finished.
    pub async fn cancel(&self, op_id: Uuid) -> Result<OperationStatusView> {
        let record = self.inner.operations.cancel(op_id).await?;
        info!(op_id = %op_id, step = ?record.current_step, "Cancellation requested");
        Ok(OperationStatusView::from(&record))
    }

    /// # Errors
    ///
    /// `NotFound` for unknown operations.
    pub async fn get_status(&self, op_id: Uuid) -> Result<OperationStatusView> {
        self.inner
            .operations
            .get(op_id)
            .await?
            .map(|record| OperationStatusView::from(&record))
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {op_id}")))
    }

    /// Wait until the operation reaches a terminal status
    ///
    /// # Errors
    ///
    /// `Timeout` when it does not finish within `timeout`.
    pub async fn wait(&self, op_id: Uuid, timeout: Duration) -> Result<OperationStatusView> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.finished.notified();
            let status = self.get_status(op_id).await?;
            if status.status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LifecycleError::Timeout {
                    step: format!("wait:{op_id}"),
                    after: timeout,
                });
            }
        }
    }

    /// # Errors
    ///
    /// Store failures.
    pub async fn installation(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<Option<ModuleInstallation>> {
        self.inner.installations.get(tenant_id, module_id).await
    }

    /// # Errors
    ///
    /// Store failures.
    pub async fn installations(&self, tenant_id: Uuid) -> Result<Vec<ModuleInstallation>> {
        self.inner.installations.list(tenant_id).await
    }

    /// Resume every operation the step log still lists as open
    ///
    /// Call once at startup, before serving requests. Sandboxes recorded on
    /// installation rows are re-adopted for monitoring.
    ///
    /// # Errors
    ///
    /// Store or step log failures.
    pub async fn recover(&self) -> Result<usize> {
        for row in self.inner.installations.all().await? {
            if let Some(handle) = row.sandbox {
                self.inner.sandboxes.adopt(handle);
            }
        }

        let open = self.inner.executor.open_operations().await?;
        for entry in &open {
            info!(op_id = %entry.op_id, kind = %entry.kind, "Resuming interrupted operation");
            self.spawn_drive(entry.op_id);
        }
        Ok(open.len())
    }

    /// Suspend installations whose sandbox crosses the violation threshold
    pub fn spawn_violation_listener(&self) -> JoinHandle<()> {
        let mut events = self.inner.sandboxes.subscribe();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(violation) => {
                        if let Err(error) = inner.handle_violation(&violation).await {
                            log_error("resource violation", &error);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Violation listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Suspend the installation owning the violating sandbox
    ///
    /// # Errors
    ///
    /// Store or sandbox backend failures.
    pub async fn handle_violation(&self, violation: &ResourceViolation) -> Result<bool> {
        self.inner.handle_violation(violation).await
    }

    async fn begin(&self, mut record: OperationRecord, retry: bool) -> Result<Uuid> {
        let inner = &self.inner;
        let acquisition = inner
            .installations
            .acquire(record.tenant_id, &record.module_id, record.id, record.kind, retry)
            .await?;
        let prior = match acquisition {
            Acquisition::Acquired { prior } => prior,
            Acquisition::Reentrant => None,
        };

        record.push_compensation(
            restore_key(&record.module_id),
            0,
            Compensation::RestoreInstallation {
                tenant_id: record.tenant_id,
                module_id: record.module_id.clone(),
                snapshot: prior.clone(),
            },
        );

        let registered = match inner.operations.create(record.clone()).await {
            Ok(()) => inner
                .executor
                .open(record.id, record.kind.as_str())
                .await
                .map_err(LifecycleError::from),
            Err(error) => Err(error),
        };
        if let Err(error) = registered {
            inner
                .installations
                .restore(record.id, record.tenant_id, &record.module_id, prior)
                .await?;
            return Err(error);
        }

        counter!("modhost_operations_started_total", "kind" => record.kind.as_str()).increment(1);
        info!(
            op_id = %record.id,
            kind = %record.kind,
            tenant_id = %record.tenant_id,
            module = %record.module_id,
            retry_of = ?record.retry_of,
            "Lifecycle operation started"
        );
        self.spawn_drive(record.id);
        Ok(record.id)
    }

    fn spawn_drive(&self, op_id: Uuid) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(error) = inner.drive(op_id).await {
                error!(op_id = %op_id, error = %error, "Operation driver stopped");
            }
        });
    }
}

impl Inner {
    fn report(&self, error: &LifecycleError) -> ErrorReport {
        let report = ErrorReport::from_error(error);
        match &self.redactor {
            Some(redactor) => {
                let message = redactor.redact(&report.message);
                report.with_message(message)
            }
            None => report,
        }
    }

    async fn drive(&self, op_id: Uuid) -> Result<()> {
        let mut record = self
            .operations
            .get(op_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {op_id}")))?;

        if record.status.is_terminal() {
            self.executor.close(op_id).await?;
            return Ok(());
        }
        if record.status == OperationStatus::Compensating {
            let cause = record.error.clone().map_or_else(
                || LifecycleError::InvalidState("compensation resumed without a cause".to_string()),
                LifecycleError::Recorded,
            );
            return self.fail(record, cause).await;
        }

        record.status = OperationStatus::Running;
        record.touch();
        self.operations.put(record.clone()).await?;

        let outcome = match record.retry_of {
            Some(previous) => self.drain(&mut record, previous).await,
            None => Ok(()),
        };
        let outcome = match outcome {
            Ok(()) => match record.kind {
                OperationKind::Install | OperationKind::Update => self.run_change(&mut record).await,
                OperationKind::Uninstall => self.run_uninstall(&mut record).await,
                OperationKind::Activate | OperationKind::Resume => self.run_activate(&mut record).await,
                OperationKind::Deactivate => self.run_deactivate(&mut record).await,
            },
            Err(error) => Err(error),
        };

        match outcome {
            Ok(()) => {
                record.status = OperationStatus::Succeeded;
                record.compensations.clear();
                self.finish(record).await
            }
            Err(error) => self.fail(record, error).await,
        }
    }

    /// Record entry into `number`; fails with `Cancelled` if flagged
    async fn enter(&self, record: &mut OperationRecord, number: u8, name: &'static str) -> Result<()> {
        let advanced = self.operations.advance(record.id, number, name).await?;
        record.current_step = advanced.current_step;
        record.step_name = advanced.step_name;
        record.status = advanced.status;
        record.cancel_requested = advanced.cancel_requested;
        Ok(())
    }

    async fn step<T, F, Fut>(
        &self,
        record: &mut OperationRecord,
        number: u8,
        name: &'static str,
        step_id: &str,
        f: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.enter(record, number, name).await?;
        let started = Instant::now();
        let outcome = self.executor.run_step(record.id, step_id, f).await;
        histogram!("modhost_step_duration_ms", "step" => name).record(started.elapsed().as_secs_f64() * 1000.0);
        outcome.map_err(LifecycleError::from)
    }

    async fn persist(&self, record: &mut OperationRecord) -> Result<()> {
        record.touch();
        self.operations.put(record.clone()).await
    }

    async fn run_change(&self, record: &mut OperationRecord) -> Result<()> {
        let op = record.id;
        let tenant = record.tenant_id;
        let target = record.module_id.clone();
        let request = record.request.clone();
        let (range, optional, upgrade) = match &request {
            OperationRequest::Install {
                version_range, optional, ..
            } => (version_range.clone(), optional.clone(), false),
            OperationRequest::Update { version_range, .. } => (version_range.clone(), Vec::new(), true),
            other => {
                return Err(LifecycleError::InvalidState(format!(
                    "{} is not an install or update",
                    other.kind()
                )))
            }
        };
        let prior = snapshot_of(record, &target);
        let activate_requested = match &request {
            OperationRequest::Install { activate, .. } => *activate,
            _ => prior
                .as_ref()
                .is_some_and(|row| row.status == InstallationStatus::Active),
        };
        let policy = self.policies.policy_for(tenant).await?;

        // 1. Resolve and lock every module the plan changes
        let (t, r, o) = (&target, &range, &optional);
        let plan: Plan = self
            .step(record, steps::RESOLVE, "resolve", "resolve", move || async move {
                self.resolve_plan(tenant, t, r, o, upgrade).await
            })
            .await?;
        self.acquire_dependencies(record, &plan).await?;
        let versions = self.plan_versions(&plan, &target)?;
        debug!(op_id = %op, plan = ?plan.entries, "Plan resolved");

        // A module keeps running when its row still had a sandbox, even one
        // left behind by a failed operation
        let previous: BTreeMap<ModuleId, Option<ModuleInstallation>> = versions
            .iter()
            .map(|version| (version.module_id.clone(), snapshot_of(record, &version.module_id)))
            .collect();
        let active: BTreeMap<ModuleId, bool> = previous
            .iter()
            .map(|(m, row)| {
                let running = row.as_ref().is_some_and(|row| row.sandbox.is_some());
                (m.clone(), activate_requested || running)
            })
            .collect();

        // 2. Gate every version that will be installed
        let (vs, p) = (&versions, &policy);
        let verdicts: Vec<GateVerdict> = self
            .step(record, steps::GATE, "gate", "gate", move || async move {
                let mut verdicts = Vec::with_capacity(vs.len());
                for version in vs {
                    verdicts.push(self.gate.require_pass(version, &p.scan).await?);
                }
                Ok(verdicts)
            })
            .await?;

        // 3. Authorize; the undo comes from grants read before the write
        let granted_by = format!("op:{op}");
        for version in &versions {
            let (m, by) = (&version.module_id, &granted_by);
            let before: Vec<PermissionGrant> = self
                .step(record, steps::AUTHORIZE, "authorize", &format!("snapshot-grants:{m}"), move || async move {
                    self.grants.list(tenant, m).await
                })
                .await?;
            let written: Vec<PermissionGrant> = self
                .step(record, steps::AUTHORIZE, "authorize", &format!("authorize:{m}"), move || async move {
                    let grants =
                        self.enforcer
                            .authorize(tenant, m, &version.required_permissions, &p.permissions, by)?;
                    self.grants.replace_all(tenant, m, grants.clone()).await?;
                    Ok(grants)
                })
                .await?;
            let change = GrantChange::between(&before, &written);
            if !change.is_empty() {
                record.push_compensation(grants_key(m), steps::AUTHORIZE, Compensation::RestoreGrants { change });
                self.persist(record).await?;
            }
        }

        // 4. Stage
        let mut staged = BTreeMap::new();
        for version in &versions {
            let m = &version.module_id;
            let staged_ref: StagedRef = self
                .step(record, steps::STAGE, "stage", &format!("stage:{m}"), move || async move {
                    self.stage_package(op, version).await
                })
                .await?;
            record.push_compensation(
                format!("unstage:{m}"),
                steps::STAGE,
                Compensation::Unstage {
                    staged: staged_ref.clone(),
                },
            );
            self.persist(record).await?;
            staged.insert(m.clone(), staged_ref);
        }

        // 5. Provision; a running module keeps its sandbox when isolation is unchanged
        let mut sandboxes = BTreeMap::new();
        for version in &versions {
            let m = &version.module_id;
            if !active.get(m).copied().unwrap_or(false) {
                continue;
            }
            self.enter(record, steps::PROVISION, "provision").await?;

            let malware = verdicts
                .iter()
                .any(|verdict| &verdict.module_id == m && verdict.malware_flagged);
            let level = self
                .selector
                .select(version.declared_risk, malware, &policy.sandbox)?;
            let limits = policy.sandbox.limits_for(version.requested_limits.as_ref());

            let current = previous.get(m).and_then(|row| row.as_ref()).and_then(|row| row.sandbox.as_ref());
            if current.is_some_and(|handle| handle.isolation_level == level && handle.limits == limits) {
                debug!(op_id = %op, module = %m, "Isolation unchanged, keeping sandbox");
                continue;
            }

            let handle: SandboxHandle = self
                .step(record, steps::PROVISION, "provision", &format!("provision:{m}"), move || async move {
                    self.provision_for(op, tenant, m, level, limits).await
                })
                .await?;
            record.push_compensation(
                sandbox_comp_key(m),
                steps::PROVISION,
                Compensation::DestroySandbox { handle: handle.clone() },
            );
            self.persist(record).await?;
            sandboxes.insert(m.clone(), handle);
        }

        // 6. Commit, dependencies first; dependency rows stay held until the
        // target is committed so a rollback never overwrites another writer
        for version in &versions {
            let m = &version.module_id;
            let change = CommitChange {
                version,
                staged: staged.get(m),
                sandbox: sandboxes.get(m),
                request: &request,
                is_target: m == &target,
                activate: active.get(m).copied().unwrap_or(false),
            };
            let change = &change;
            self.step(record, steps::COMMIT, "commit", &format!("commit:{m}"), move || async move {
                self.commit_change(op, tenant, change).await
            })
            .await?;
        }
        for version in versions.iter().filter(|version| version.module_id != target) {
            let m = &version.module_id;
            self.step(record, steps::COMMIT, "release", &format!("release:{m}"), move || async move {
                self.release_row(op, tenant, m).await
            })
            .await?;
        }

        for version in &versions {
            let m = &version.module_id;
            if let Some(Some(replaced)) = previous.get(m) {
                self.cleanup_replaced(op, replaced, sandboxes.get(m), staged.get(m)).await;
            }
        }
        Ok(())
    }

    async fn resolve_plan(
        &self,
        tenant: Uuid,
        target: &ModuleId,
        range: &VersionReq,
        optional: &[ModuleId],
        upgrade: bool,
    ) -> Result<Plan> {
        let installed: BTreeMap<ModuleId, Version> = self
            .installations
            .list(tenant)
            .await?
            .into_iter()
            .filter_map(|row| row.version.map(|version| (row.module_id, version)))
            .collect();

        let mut request = ResolveRequest::new(target.clone(), range.clone()).with_installed(installed);
        if upgrade {
            request = request.upgrading(target.clone());
        }
        for module_id in optional {
            request = request.with_optional(module_id.clone());
        }
        Ok(self.resolver.resolve_request(&request)?)
    }

    async fn acquire_dependencies(&self, record: &mut OperationRecord, plan: &Plan) -> Result<()> {
        for entry in plan.changes() {
            if entry.module_id == record.module_id {
                continue;
            }
            let kind = match entry.action {
                PlanAction::Upgrade => OperationKind::Update,
                PlanAction::Install | PlanAction::Keep => OperationKind::Install,
            };
            let acquisition = self
                .installations
                .acquire(record.tenant_id, &entry.module_id, record.id, kind, false)
                .await?;

            let key = restore_key(&entry.module_id);
            let snapshot = match acquisition {
                Acquisition::Acquired { prior } => Some(prior),
                // Taken by an earlier run; only fresh installs reach here
                Acquisition::Reentrant if !record.compensations.iter().any(|pending| pending.key == key) => Some(None),
                Acquisition::Reentrant => None,
            };
            if let Some(snapshot) = snapshot {
                record.push_compensation(
                    key,
                    steps::RESOLVE,
                    Compensation::RestoreInstallation {
                        tenant_id: record.tenant_id,
                        module_id: entry.module_id.clone(),
                        snapshot,
                    },
                );
            }
            if !record.holds(&entry.module_id) {
                record.acquired.push(entry.module_id.clone());
            }
            self.persist(record).await?;
        }
        Ok(())
    }

    /// Versions the operation installs or upgrades, plus an update's target
    fn plan_versions(&self, plan: &Plan, target: &ModuleId) -> Result<Vec<ModuleVersion>> {
        plan.entries
            .iter()
            .filter(|entry| entry.action != PlanAction::Keep || &entry.module_id == target)
            .map(|entry| {
                self.catalog
                    .version(&entry.module_id, &entry.version)
                    .ok_or_else(|| LifecycleError::NotFound(format!("{}@{}", entry.module_id, entry.version)))
            })
            .collect()
    }

    async fn stage_package(&self, op: Uuid, version: &ModuleVersion) -> Result<StagedRef> {
        let staged = self
            .storage
            .stage(&version.content_hash, &effect_key(op, &version.module_id))
            .await?;
        let bytes = self.storage.read_staged(&staged).await?;
        if let Err(error) = verify_content(&bytes, &version.content_hash) {
            warn!(module = %version.module_id, version = %version.version, "Staged package failed verification");
            self.storage.unstage(&staged).await?;
            return Err(error);
        }
        Ok(staged)
    }

    async fn provision_for(
        &self,
        op: Uuid,
        tenant: Uuid,
        module_id: &ModuleId,
        level: IsolationLevel,
        limits: ResourceLimits,
    ) -> Result<SandboxHandle> {
        let row = self
            .installations
            .get(tenant, module_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("installation {module_id}")))?;
        let grants = self.grants.list(tenant, module_id).await?;

        self.sandboxes
            .provision(SandboxRequest {
                key: effect_key(op, module_id),
                installation_id: row.id,
                tenant_id: tenant,
                module_id: module_id.clone(),
                level,
                limits,
                capabilities: capability_set(&grants),
            })
            .await
    }

    /// The row `op` holds, or `None` when `op` already committed it
    async fn held_row(&self, op: Uuid, tenant: Uuid, module_id: &ModuleId) -> Result<Option<ModuleInstallation>> {
        let row = self
            .installations
            .get(tenant, module_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("installation {module_id}")))?;
        if row.active_operation == Some(op) {
            return Ok(Some(row));
        }
        if row.active_operation.is_none() && row.last_operation == Some(op) {
            return Ok(None);
        }
        Err(LifecycleError::InvalidState(format!(
            "operation {op} no longer holds {module_id}"
        )))
    }

    async fn commit_change(&self, op: Uuid, tenant: Uuid, change: &CommitChange<'_>) -> Result<()> {
        let module_id = &change.version.module_id;
        let Some(mut row) = self.held_row(op, tenant, module_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let fresh = row.version.is_none();

        row.version = Some(change.version.version.clone());
        if let Some(staged) = change.staged {
            row.staged = Some(staged.clone());
        }
        match change.request {
            OperationRequest::Install { configuration, .. } if change.is_target => {
                row.configuration = configuration.clone();
            }
            OperationRequest::Update {
                configuration: Some(configuration),
                ..
            } if change.is_target => {
                row.configuration = configuration.clone();
            }
            _ => {}
        }
        row.status = if change.activate {
            InstallationStatus::Active
        } else if row.prior_status == Some(InstallationStatus::Inactive) {
            InstallationStatus::Inactive
        } else {
            InstallationStatus::Installed
        };
        if fresh {
            row.installed_at = Some(now);
        }
        if let Some(sandbox) = change.sandbox {
            row.sandbox = Some(sandbox.clone());
            row.activated_at = Some(now);
        }
        if change.is_target {
            row.prior_status = None;
            row.active_operation = None;
        }
        row.last_operation = Some(op);
        row.last_error = None;
        row.updated_at = now;

        if let Some(redactor) = &self.redactor {
            debug!(
                module = %module_id,
                configuration = %redactor.redact_json(&row.configuration),
                "Committing installation"
            );
        }
        info!(op_id = %op, installation = %row.label(), status = %row.status, "Installation committed");
        self.installations.commit(op, row).await
    }

    /// Hand a committed dependency row back once the target committed
    async fn release_row(&self, op: Uuid, tenant: Uuid, module_id: &ModuleId) -> Result<()> {
        let Some(mut row) = self.held_row(op, tenant, module_id).await? else {
            return Ok(());
        };
        row.prior_status = None;
        row.active_operation = None;
        row.last_operation = Some(op);
        row.updated_at = Utc::now();
        debug!(op_id = %op, installation = %row.label(), "Dependency row released");
        self.installations.commit(op, row).await
    }

    /// Retire what the operation replaced on a row it already committed
    async fn cleanup_replaced(
        &self,
        op: Uuid,
        prior: &ModuleInstallation,
        new_sandbox: Option<&SandboxHandle>,
        new_staged: Option<&StagedRef>,
    ) {
        let options = StepOptions::compensation(self.settings.orchestrator.compensation_retry.clone());
        let m = &prior.module_id;

        if let (Some(old), Some(_)) = (&prior.sandbox, new_sandbox) {
            let outcome = self
                .executor
                .run_step_with(op, &format!("cleanup:sandbox:{m}"), options.clone(), move || async move {
                    self.sandboxes.destroy(old).await
                })
                .await;
            if let Err(error) = outcome {
                warn!(op_id = %op, sandbox = %old.id, error = %error, "Replaced sandbox not destroyed");
            }
        }

        if let Some(old) = prior.staged.as_ref().filter(|old| Some(*old) != new_staged) {
            let outcome = self
                .executor
                .run_step_with(op, &format!("cleanup:staged:{m}"), options, move || async move {
                    self.storage.unstage(old).await
                })
                .await;
            if let Err(error) = outcome {
                warn!(op_id = %op, reference = %old.reference, error = %error, "Replaced package not unstaged");
            }
        }
    }

    async fn check_dependents(&self, tenant: Uuid, module_id: &ModuleId) -> Result<()> {
        let dependents: Vec<ModuleId> = self
            .installations
            .list(tenant)
            .await?
            .into_iter()
            .filter(|row| &row.module_id != module_id)
            .filter(|row| {
                row.version
                    .as_ref()
                    .and_then(|version| self.catalog.version(&row.module_id, version))
                    .is_some_and(|release| {
                        release
                            .dependencies
                            .iter()
                            .any(|dependency| &dependency.module_id == module_id && !dependency.optional)
                    })
            })
            .map(|row| row.module_id)
            .collect();

        if dependents.is_empty() {
            Ok(())
        } else {
            Err(ConflictError::RequiredBy {
                module_id: module_id.clone(),
                dependents,
            }
            .into())
        }
    }

    /// Destroy the row's sandbox and clear it while `op` still holds the row
    async fn release_sandbox(&self, op: Uuid, tenant: Uuid, module_id: &ModuleId) -> Result<()> {
        let Some(mut row) = self.held_row(op, tenant, module_id).await? else {
            return Ok(());
        };
        if let Some(handle) = row.sandbox.take() {
            self.sandboxes.destroy(&handle).await?;
            row.updated_at = Utc::now();
            self.installations.commit(op, row).await?;
        }
        Ok(())
    }

    async fn run_uninstall(&self, record: &mut OperationRecord) -> Result<()> {
        let (op, tenant) = (record.id, record.tenant_id);
        let target = record.module_id.clone();
        let t = &target;

        self.step(record, steps::RESOLVE, "check_dependents", "check_dependents", move || async move {
            self.check_dependents(tenant, t).await
        })
        .await?;

        let before: Vec<PermissionGrant> = self
            .step(record, steps::AUTHORIZE, "revoke", "snapshot-grants", move || async move {
                self.grants.list(tenant, t).await
            })
            .await?;
        self.step(record, steps::AUTHORIZE, "revoke", "revoke", move || async move {
            self.grants.revoke_all(tenant, t).await
        })
        .await?;
        let change = GrantChange::revoked(before);
        if !change.is_empty() {
            record.push_compensation(grants_key(t), steps::AUTHORIZE, Compensation::RestoreGrants { change });
            self.persist(record).await?;
        }

        self.step(record, steps::PROVISION, "destroy", "destroy", move || async move {
            self.release_sandbox(op, tenant, t).await
        })
        .await?;
        rebase_snapshot(record);
        self.persist(record).await?;

        self.step(record, steps::COMMIT, "remove", "remove", move || async move {
            if let Some(row) = self.installations.get(tenant, t).await? {
                if let Some(staged) = &row.staged {
                    self.storage.unstage(staged).await?;
                }
            }
            self.installations.remove(op, tenant, t).await
        })
        .await?;
        info!(op_id = %op, module = %target, "Module uninstalled");
        Ok(())
    }

    async fn run_activate(&self, record: &mut OperationRecord) -> Result<()> {
        let (op, tenant) = (record.id, record.tenant_id);
        let target = record.module_id.clone();
        let t = &target;

        let row = self
            .installations
            .get(tenant, t)
            .await?
            .ok_or_else(|| ConflictError::NotInstalled(target.clone()))?;
        let installed = row
            .version
            .ok_or_else(|| LifecycleError::InvalidState(format!("{target} has no committed version")))?;
        let version = self
            .catalog
            .version(t, &installed)
            .ok_or_else(|| LifecycleError::NotFound(format!("{target}@{installed}")))?;
        let policy = self.policies.policy_for(tenant).await?;

        let (v, p) = (&version, &policy);
        let verdict: GateVerdict = self
            .step(record, steps::GATE, "gate", "gate", move || async move {
                self.gate.require_pass(v, &p.scan).await
            })
            .await?;

        self.enter(record, steps::PROVISION, "provision").await?;
        let level = self
            .selector
            .select(version.declared_risk, verdict.malware_flagged, &policy.sandbox)?;
        let limits = policy.sandbox.limits_for(version.requested_limits.as_ref());
        let handle: SandboxHandle = self
            .step(record, steps::PROVISION, "provision", "provision", move || async move {
                self.provision_for(op, tenant, t, level, limits).await
            })
            .await?;
        record.push_compensation(
            sandbox_comp_key(t),
            steps::PROVISION,
            Compensation::DestroySandbox { handle: handle.clone() },
        );
        self.persist(record).await?;

        let h = &handle;
        self.step(record, steps::COMMIT, "commit", "commit", move || async move {
            let Some(mut row) = self.held_row(op, tenant, t).await? else {
                return Ok(());
            };
            let now = Utc::now();
            row.status = InstallationStatus::Active;
            row.sandbox = Some(h.clone());
            row.activated_at = Some(now);
            row.prior_status = None;
            row.active_operation = None;
            row.last_operation = Some(op);
            row.last_error = None;
            row.updated_at = now;
            self.installations.commit(op, row).await
        })
        .await?;
        info!(op_id = %op, module = %target, level = %handle.isolation_level, "Module activated");
        Ok(())
    }

    async fn run_deactivate(&self, record: &mut OperationRecord) -> Result<()> {
        let (op, tenant) = (record.id, record.tenant_id);
        let target = record.module_id.clone();
        let t = &target;

        self.step(record, steps::PROVISION, "destroy", "destroy", move || async move {
            self.release_sandbox(op, tenant, t).await
        })
        .await?;
        rebase_snapshot(record);
        self.persist(record).await?;

        self.step(record, steps::COMMIT, "commit", "commit", move || async move {
            let Some(mut row) = self.held_row(op, tenant, t).await? else {
                return Ok(());
            };
            row.status = InstallationStatus::Inactive;
            row.sandbox = None;
            row.prior_status = None;
            row.active_operation = None;
            row.last_operation = Some(op);
            row.updated_at = Utc::now();
            self.installations.commit(op, row).await
        })
        .await?;
        info!(op_id = %op, module = %target, "Module deactivated");
        Ok(())
    }

    async fn apply_compensation(&self, op: Uuid, action: &Compensation) -> Result<()> {
        match action {
            Compensation::RestoreGrants { change } => self.grants.restore(change).await,
            Compensation::Unstage { staged } => self.storage.unstage(staged).await,
            Compensation::DestroySandbox { handle } => self.sandboxes.destroy(handle).await,
            Compensation::RestoreInstallation {
                tenant_id,
                module_id,
                snapshot,
            } => {
                self.installations
                    .restore(op, *tenant_id, module_id, snapshot.clone())
                    .await
            }
        }
    }

    /// Run pending compensations newest first
    ///
    /// Every compensation is attempted even after one is exhausted; the
    /// first exhausted one is returned.
    async fn compensate(&self, record: &mut OperationRecord) -> Result<()> {
        let options = StepOptions::compensation(self.settings.orchestrator.compensation_retry.clone());
        let pending: Vec<_> = record.compensations.iter().rev().cloned().collect();
        let op = record.id;
        let mut exhausted = None;

        for entry in pending {
            let action = &entry.action;
            let outcome = self
                .executor
                .run_step_with(op, &format!("compensate:{}", entry.key), options.clone(), move || async move {
                    self.apply_compensation(op, action).await
                })
                .await
                .map_err(LifecycleError::from);

            match outcome {
                Ok(()) => {
                    counter!("modhost_compensations_total", "outcome" => "applied").increment(1);
                    debug!(op_id = %op, compensation = %entry.key, "Compensation applied");
                    record.drop_compensation(&entry.key);
                    self.persist(record).await?;
                }
                Err(error) => {
                    counter!("modhost_compensations_total", "outcome" => "exhausted").increment(1);
                    error!(op_id = %op, compensation = %entry.key, error = %error, "Compensation exhausted");
                    if exhausted.is_none() {
                        exhausted = Some(LifecycleError::CompensationExhausted {
                            step: entry.key.clone(),
                            report: self.report(&error),
                        });
                    }
                }
            }
        }

        exhausted.map_or(Ok(()), Err)
    }

    /// Finish compensations a failed operation left behind
    async fn drain(&self, record: &mut OperationRecord, previous_id: Uuid) -> Result<()> {
        let Some(mut previous) = self.operations.get(previous_id).await? else {
            return Ok(());
        };
        let options = StepOptions::compensation(self.settings.orchestrator.compensation_retry.clone());
        let pending: Vec<_> = previous.compensations.iter().rev().cloned().collect();

        for entry in pending {
            let skip = matches!(
                &entry.action,
                Compensation::RestoreInstallation { module_id, .. } if module_id == &record.module_id
            );
            if !skip {
                let action = &entry.action;
                self.executor
                    .run_step_with(
                        record.id,
                        &format!("drain:{previous_id}:{}", entry.key),
                        options.clone(),
                        move || async move { self.apply_compensation(previous_id, action).await },
                    )
                    .await?;
                debug!(op_id = %record.id, previous = %previous_id, compensation = %entry.key, "Drained compensation");
            }
            previous.drop_compensation(&entry.key);
            self.operations.put(previous.clone()).await?;
        }
        Ok(())
    }

    async fn fail(&self, mut record: OperationRecord, cause: LifecycleError) -> Result<()> {
        let cancelled = cause.is_cancellation();
        let report = self.report(&cause);
        if cancelled {
            info!(op_id = %record.id, step = ?record.current_step, "Operation cancelled, compensating");
        } else {
            log_error("lifecycle operation", &cause);
        }

        record.status = OperationStatus::Compensating;
        record.error = Some(report.clone());
        self.persist(&mut record).await?;

        match self.compensate(&mut record).await {
            Ok(()) => {
                record.status = if cancelled {
                    OperationStatus::Cancelled
                } else {
                    OperationStatus::RolledBack
                };
            }
            Err(exhausted) => {
                record.status = OperationStatus::Failed;
                record.compensation_error = Some(self.report(&exhausted));
                self.mark_failed(&record, &report).await?;
            }
        }
        self.finish(record).await
    }

    /// Park every row the operation held in `Failed` for an operator
    async fn mark_failed(&self, record: &OperationRecord, report: &ErrorReport) -> Result<()> {
        let now = Utc::now();
        for module_id in &record.acquired {
            let row = match self.installations.get(record.tenant_id, module_id).await? {
                Some(row) if row.active_operation.is_some_and(|holder| holder != record.id) => continue,
                Some(row) => row,
                None if module_id == &record.module_id => {
                    ModuleInstallation::reserved(record.tenant_id, module_id.clone(), record.id)
                }
                None => continue,
            };
            let mut row = row;
            row.status = InstallationStatus::Failed;
            row.prior_status = None;
            row.active_operation = None;
            row.last_operation = Some(record.id);
            row.last_error = Some(report.clone());
            row.updated_at = now;
            self.installations.put(row).await?;
            warn!(
                op_id = %record.id,
                module = %module_id,
                error_code = %report.code,
                "Installation marked failed, operator intervention required"
            );
        }
        Ok(())
    }

    async fn finish(&self, mut record: OperationRecord) -> Result<()> {
        self.persist(&mut record).await?;
        self.executor.close(record.id).await?;

        let elapsed_ms = (Utc::now() - record.created_at).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let elapsed = elapsed_ms as f64;
        counter!(
            "modhost_operations_finished_total",
            "kind" => record.kind.as_str(),
            "outcome" => record.status.as_str()
        )
        .increment(1);
        histogram!("modhost_operation_duration_ms", "kind" => record.kind.as_str()).record(elapsed);
        info!(
            op_id = %record.id,
            kind = %record.kind,
            module = %record.module_id,
            status = %record.status,
            elapsed_ms = elapsed_ms,
            "Lifecycle operation finished"
        );
        self.finished.notify_waiters();
        Ok(())
    }

    async fn handle_violation(&self, violation: &ResourceViolation) -> Result<bool> {
        let handle = &violation.handle;
        let Some(row) = self.installations.get(handle.tenant_id, &handle.module_id).await? else {
            warn!(sandbox = %handle.id, "Violation from a sandbox without installation, destroying");
            self.sandboxes.destroy(handle).await?;
            return Ok(false);
        };

        if row.active_operation.is_some() {
            info!(
                module = %row.module_id,
                op_id = ?row.active_operation,
                "Ignoring violation while an operation is in flight"
            );
            return Ok(false);
        }
        if row.status != InstallationStatus::Active || row.sandbox.as_ref().map(|h| h.id) != Some(handle.id) {
            debug!(module = %row.module_id, status = %row.status, "Ignoring violation for a stale sandbox");
            return Ok(false);
        }

        let exceeded = violation
            .exceeded
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let mut suspended = row.clone();
        suspended.status = InstallationStatus::Suspended;
        suspended.sandbox = None;
        suspended.updated_at = Utc::now();
        suspended.last_error = Some(ErrorReport {
            code: error_common::codes::resource::RESOURCE_VIOLATION.to_string(),
            class: error_common::ErrorClass::Resource,
            message: format!(
                "sandbox exceeded {exceeded} limits {} times",
                violation.violations
            ),
        });

        if !self
            .installations
            .replace_if(InstallationStatus::Active, suspended)
            .await?
        {
            debug!(module = %row.module_id, "Installation changed before suspension");
            return Ok(false);
        }

        self.sandboxes.destroy(handle).await?;
        counter!("modhost_installations_suspended_total").increment(1);
        warn!(
            tenant_id = %row.tenant_id,
            module = %row.module_id,
            exceeded = %exceeded,
            "Installation suspended after resource violations"
        );
        Ok(true)
    }
}
