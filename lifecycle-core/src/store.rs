//! Installation and operation persistence
//!
//! The installation row doubles as the per-(tenant, module) operation lock:
//! acquiring moves it into an in-flight status and stamps the holder's
//! operation id. Stores must make [`InstallationStore::acquire`] atomic per
//! key so the one-operation-in-flight rule survives multiple workers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConflictError, LifecycleError, Result};
use crate::model::{InstallationStatus, ModuleId, ModuleInstallation};
use crate::operation::{OperationKind, OperationRecord, OperationStatus};

/// What acquiring a row would do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    /// Take the row, moving it to this in-flight status
    Acquire(InstallationStatus),
    /// The operation already holds the row
    Reentrant,
}

/// Decide whether `op_id` may take the row for `kind`
///
/// `retry` lets an operation take a `Failed` row whatever its kind. A
/// `Failed` row that never committed a version can always be installed.
///
/// # Errors
///
/// `OperationInProgress` while another operation holds the row, otherwise
/// the conflict that makes the transition invalid.
pub fn lock_for(
    existing: Option<&ModuleInstallation>,
    module_id: &ModuleId,
    op_id: Uuid,
    kind: OperationKind,
    retry: bool,
) -> std::result::Result<LockDecision, ConflictError> {
    let Some(row) = existing else {
        return if kind == OperationKind::Install {
            Ok(LockDecision::Acquire(kind.in_flight_status()))
        } else {
            Err(ConflictError::NotInstalled(module_id.clone()))
        };
    };

    if row.active_operation == Some(op_id) {
        return Ok(LockDecision::Reentrant);
    }
    // Dependency rows stay held after their commit until the target commits
    if row.active_operation.is_some() || row.status.is_in_flight() {
        return Err(ConflictError::OperationInProgress {
            tenant_id: row.tenant_id,
            module_id: module_id.clone(),
            operation_id: row.active_operation,
        });
    }
    let failed = row.status == InstallationStatus::Failed;
    let never_installed = failed && row.version.is_none() && kind == OperationKind::Install;
    if (retry && failed) || never_installed || kind.allowed_from(row.status) {
        return Ok(LockDecision::Acquire(kind.in_flight_status()));
    }
    if kind == OperationKind::Install {
        Err(ConflictError::AlreadyInstalled(module_id.clone()))
    } else {
        Err(ConflictError::InvalidTransition {
            module_id: module_id.clone(),
            from: row.status,
            operation: kind,
        })
    }
}

/// Outcome of a successful acquire
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// Row taken; `prior` is the row before (None when it was created)
    Acquired { prior: Option<ModuleInstallation> },
    Reentrant,
}

#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// Atomically take the row for an operation
    async fn acquire(
        &self,
        tenant_id: Uuid,
        module_id: &ModuleId,
        op_id: Uuid,
        kind: OperationKind,
        retry: bool,
    ) -> Result<Acquisition>;

    async fn get(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<Option<ModuleInstallation>>;

    async fn list(&self, tenant_id: Uuid) -> Result<Vec<ModuleInstallation>>;

    /// Every row across tenants, for the recovery sweep
    async fn all(&self) -> Result<Vec<ModuleInstallation>>;

    /// Write the row held by `op_id`
    ///
    /// Fails with `InvalidState` if the row is held by someone else.
    async fn commit(&self, op_id: Uuid, row: ModuleInstallation) -> Result<()>;

    /// Put back `snapshot` (or drop the row) while `op_id` holds the row or
    /// was the last operation to release it
    async fn restore(
        &self,
        op_id: Uuid,
        tenant_id: Uuid,
        module_id: &ModuleId,
        snapshot: Option<ModuleInstallation>,
    ) -> Result<()>;

    /// Remove the row held by `op_id`
    async fn remove(&self, op_id: Uuid, tenant_id: Uuid, module_id: &ModuleId) -> Result<()>;

    /// Replace an idle row only while it still has `expected` status
    async fn replace_if(&self, expected: InstallationStatus, row: ModuleInstallation) -> Result<bool>;

    /// Unconditional write, for operator-facing failure marking
    async fn put(&self, row: ModuleInstallation) -> Result<()>;
}

type RowKey = (Uuid, ModuleId);

/// In-memory installation store for testing and development
pub struct InMemoryInstallationStore {
    rows: Arc<DashMap<RowKey, ModuleInstallation>>,
}

impl InMemoryInstallationStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for InMemoryInstallationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// `op_id` holds the row, or released it and nobody took it since
fn held_by(row: &ModuleInstallation, op_id: Uuid) -> bool {
    match row.active_operation {
        Some(holder) => holder == op_id,
        None => row.last_operation == Some(op_id),
    }
}

#[async_trait]
impl InstallationStore for InMemoryInstallationStore {
    async fn acquire(
        &self,
        tenant_id: Uuid,
        module_id: &ModuleId,
        op_id: Uuid,
        kind: OperationKind,
        retry: bool,
    ) -> Result<Acquisition> {
        match self.rows.entry((tenant_id, module_id.clone())) {
            Entry::Vacant(vacant) => {
                lock_for(None, module_id, op_id, kind, retry)?;
                vacant.insert(ModuleInstallation::reserved(tenant_id, module_id.clone(), op_id));
                debug!(tenant_id = %tenant_id, module = %module_id, op_id = %op_id, "Installation row reserved");
                Ok(Acquisition::Acquired { prior: None })
            }
            Entry::Occupied(mut occupied) => {
                match lock_for(Some(occupied.get()), module_id, op_id, kind, retry)? {
                    LockDecision::Reentrant => Ok(Acquisition::Reentrant),
                    LockDecision::Acquire(status) => {
                        let prior = occupied.get().clone();
                        let row = occupied.get_mut();
                        row.prior_status = Some(prior.status);
                        row.status = status;
                        row.active_operation = Some(op_id);
                        row.last_operation = Some(op_id);
                        row.updated_at = Utc::now();
                        debug!(tenant_id = %tenant_id, module = %module_id, op_id = %op_id, status = %status, "Installation row acquired");
                        Ok(Acquisition::Acquired { prior: Some(prior) })
                    }
                }
            }
        }
    }

    async fn get(&self, tenant_id: Uuid, module_id: &ModuleId) -> Result<Option<ModuleInstallation>> {
        Ok(self
            .rows
            .get(&(tenant_id, module_id.clone()))
            .map(|entry| entry.value().clone()))
    }

    async fn list(&self, tenant_id: Uuid) -> Result<Vec<ModuleInstallation>> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        Ok(rows)
    }

    async fn all(&self) -> Result<Vec<ModuleInstallation>> {
        Ok(self.rows.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn commit(&self, op_id: Uuid, row: ModuleInstallation) -> Result<()> {
        let key = (row.tenant_id, row.module_id.clone());
        match self.rows.entry(key) {
            Entry::Occupied(mut occupied) if occupied.get().active_operation == Some(op_id) => {
                occupied.insert(row);
                Ok(())
            }
            _ => Err(LifecycleError::InvalidState(format!(
                "operation {op_id} does not hold {}",
                row.module_id
            ))),
        }
    }

    async fn restore(
        &self,
        op_id: Uuid,
        tenant_id: Uuid,
        module_id: &ModuleId,
        snapshot: Option<ModuleInstallation>,
    ) -> Result<()> {
        match self.rows.entry((tenant_id, module_id.clone())) {
            Entry::Occupied(mut occupied) => {
                if !held_by(occupied.get(), op_id) {
                    debug!(module = %module_id, op_id = %op_id, "Row held elsewhere, not restoring");
                    return Ok(());
                }
                match snapshot {
                    Some(row) => {
                        occupied.insert(row);
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if let Some(row) = snapshot {
                    vacant.insert(row);
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, op_id: Uuid, tenant_id: Uuid, module_id: &ModuleId) -> Result<()> {
        self.rows
            .remove_if(&(tenant_id, module_id.clone()), |_, row| row.active_operation == Some(op_id));
        Ok(())
    }

    async fn replace_if(&self, expected: InstallationStatus, row: ModuleInstallation) -> Result<bool> {
        match self.rows.entry((row.tenant_id, row.module_id.clone())) {
            Entry::Occupied(mut occupied)
                if occupied.get().status == expected && occupied.get().active_operation.is_none() =>
            {
                occupied.insert(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put(&self, row: ModuleInstallation) -> Result<()> {
        self.rows.insert((row.tenant_id, row.module_id.clone()), row);
        Ok(())
    }
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, record: OperationRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<OperationRecord>>;

    /// Persist the record; a cancellation flag already stored is kept
    async fn put(&self, record: OperationRecord) -> Result<()>;

    /// Move to `step`, failing with `Cancelled` if cancellation was requested
    async fn advance(&self, id: Uuid, step: u8, name: &str) -> Result<OperationRecord>;

    /// Atomically flag the operation for cancellation
    async fn cancel(&self, id: Uuid) -> Result<OperationRecord>;
}

/// In-memory operation store for testing and development
pub struct InMemoryOperationStore {
    records: Arc<DashMap<Uuid, OperationRecord>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryOperationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create(&self, record: OperationRecord) -> Result<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(LifecycleError::InvalidState(format!(
                "operation {} already exists",
                record.id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<OperationRecord>> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, mut record: OperationRecord) -> Result<()> {
        if let Some(existing) = self.records.get(&record.id) {
            record.cancel_requested |= existing.cancel_requested;
        }
        self.records.insert(record.id, record);
        Ok(())
    }

    async fn advance(&self, id: Uuid, step: u8, name: &str) -> Result<OperationRecord> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {id}")))?;
        if record.cancel_requested && record.kind.is_cancellable() {
            return Err(LifecycleError::Cancelled(id));
        }
        record.current_step = Some(step);
        record.step_name = Some(name.to_string());
        if record.status == OperationStatus::Pending {
            record.status = OperationStatus::Running;
        }
        record.touch();
        Ok(record.clone())
    }

    async fn cancel(&self, id: Uuid) -> Result<OperationRecord> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| LifecycleError::NotFound(format!("operation {id}")))?;
        record.request_cancel()?;
        Ok(record.clone())
    }
}
