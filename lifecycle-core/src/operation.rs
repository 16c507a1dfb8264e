//! Lifecycle operation records
//!
//! An [`OperationRecord`] is the durable bookkeeping of one orchestrated
//! operation: what was asked, which step it reached, and the compensations
//! its completed steps left behind. Compensations are pushed as steps
//! complete and run newest first when a later step fails.

use std::fmt;

use chrono::{DateTime, Utc};
use error_common::ErrorReport;
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::model::{InstallationStatus, ModuleId, ModuleInstallation};
use crate::permissions::GrantChange;
use crate::sandbox::SandboxHandle;
use crate::storage::StagedRef;

/// Step numbers shared by every operation kind
pub mod steps {
    pub const RESOLVE: u8 = 1;
    pub const GATE: u8 = 2;
    pub const AUTHORIZE: u8 = 3;
    pub const STAGE: u8 = 4;
    pub const PROVISION: u8 = 5;
    pub const COMMIT: u8 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Update,
    Uninstall,
    Activate,
    Deactivate,
    Resume,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Resume => "resume",
        }
    }

    /// Stable statuses this operation may start from
    pub fn allowed_from(&self, status: InstallationStatus) -> bool {
        use InstallationStatus as S;
        match self {
            Self::Install => status == S::Available,
            Self::Update => matches!(status, S::Installed | S::Active | S::Inactive),
            Self::Uninstall => matches!(status, S::Installed | S::Active | S::Inactive | S::Suspended | S::Failed),
            Self::Activate => matches!(status, S::Installed | S::Inactive),
            Self::Deactivate => matches!(status, S::Active | S::Suspended),
            Self::Resume => status == S::Suspended,
        }
    }

    /// Status the row holds while this operation owns it
    pub fn in_flight_status(&self) -> InstallationStatus {
        match self {
            Self::Install => InstallationStatus::Installing,
            Self::Update => InstallationStatus::Updating,
            Self::Uninstall => InstallationStatus::Uninstalling,
            Self::Activate | Self::Resume => InstallationStatus::Activating,
            Self::Deactivate => InstallationStatus::Deactivating,
        }
    }

    /// Only install and update accept tenant cancellation
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Install | Self::Update)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asked for; enough to re-issue the operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationRequest {
    Install {
        version_range: VersionReq,
        #[serde(default)]
        configuration: serde_json::Value,
        /// Provision a sandbox and go straight to `Active`
        activate: bool,
        /// Optional dependencies to pull in
        #[serde(default)]
        optional: Vec<ModuleId>,
    },
    Update {
        version_range: VersionReq,
        #[serde(default)]
        configuration: Option<serde_json::Value>,
    },
    Uninstall,
    Activate,
    Deactivate,
    Resume,
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Install { .. } => OperationKind::Install,
            Self::Update { .. } => OperationKind::Update,
            Self::Uninstall => OperationKind::Uninstall,
            Self::Activate => OperationKind::Activate,
            Self::Deactivate => OperationKind::Deactivate,
            Self::Resume => OperationKind::Resume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Compensating,
    Succeeded,
    /// Failed and fully compensated
    RolledBack,
    /// Compensation exhausted its budget; operator action needed
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::RolledBack | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Undo action for a completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Compensation {
    RestoreGrants { change: GrantChange },
    Unstage { staged: StagedRef },
    DestroySandbox { handle: SandboxHandle },
    /// Put the row back as it was before the operation, or remove it
    RestoreInstallation {
        tenant_id: Uuid,
        module_id: ModuleId,
        snapshot: Option<ModuleInstallation>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCompensation {
    /// Unique within the operation; also names the compensation step
    pub key: String,
    /// Forward step that registered it
    pub step: u8,
    pub action: Compensation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    pub request: OperationRequest,
    pub status: OperationStatus,
    pub current_step: Option<u8>,
    pub step_name: Option<String>,
    /// Root cause of a failed or cancelled operation, redacted
    pub error: Option<ErrorReport>,
    /// Compensation failure that left the operation `Failed`
    pub compensation_error: Option<ErrorReport>,
    /// Undo actions, oldest first
    pub compensations: Vec<PendingCompensation>,
    /// Rows this operation holds the lock on, target first
    pub acquired: Vec<ModuleId>,
    /// Sticky; set by `cancel`
    pub cancel_requested: bool,
    /// Failed operation this one retries
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(tenant_id: Uuid, module_id: ModuleId, request: OperationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: request.kind(),
            tenant_id,
            module_id: module_id.clone(),
            request,
            status: OperationStatus::Pending,
            current_step: None,
            step_name: None,
            error: None,
            compensation_error: None,
            compensations: Vec::new(),
            acquired: vec![module_id],
            cancel_requested: false,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Register an undo action; a key already present is replaced in place
    pub fn push_compensation(&mut self, key: impl Into<String>, step: u8, action: Compensation) {
        let key = key.into();
        let entry = PendingCompensation { key, step, action };
        match self.compensations.iter_mut().find(|pending| pending.key == entry.key) {
            Some(existing) => *existing = entry,
            None => self.compensations.push(entry),
        }
        self.touch();
    }

    pub fn drop_compensation(&mut self, key: &str) {
        self.compensations.retain(|pending| pending.key != key);
        self.touch();
    }

    pub fn holds(&self, module_id: &ModuleId) -> bool {
        self.acquired.contains(module_id)
    }

    /// Flag the operation for cancellation at its next step boundary
    ///
    /// # Errors
    ///
    /// `InvalidState` once the operation finished, started compensating,
    /// reached the commit step, or is not an install or update.
    pub fn request_cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LifecycleError::InvalidState(format!(
                "operation {} already {}",
                self.id, self.status
            )));
        }
        if self.status == OperationStatus::Compensating {
            return Err(LifecycleError::InvalidState(format!(
                "operation {} is already compensating",
                self.id
            )));
        }
        if !self.kind.is_cancellable() {
            return Err(LifecycleError::InvalidState(format!("{} operations cannot be cancelled", self.kind)));
        }
        if self.current_step.is_some_and(|step| step >= steps::COMMIT) {
            return Err(LifecycleError::InvalidState(format!(
                "operation {} is past the point of cancellation",
                self.id
            )));
        }
        self.cancel_requested = true;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
