//! Lifecycle error types
//!
//! Every failure an operation can record is a [`LifecycleError`]. Each
//! variant maps to a stable code and an [`ErrorClass`] so the durable
//! substrate knows which step failures are worth retrying.

use std::fmt;
use std::time::Duration;

use error_common::{codes, Classified, ErrorClass, ErrorReport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use workflow_engine::{StepError, WorkflowError};

use crate::model::{InstallationStatus, ModuleId};
use crate::operation::OperationKind;
use crate::sandbox::IsolationLevel;

/// One requester's range on a contested module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// `module@version` of the requester, or `request` for the caller
    pub requester: String,
    pub range: String,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires {}", self.requester, self.range)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Client-correctable conflicts, surfaced verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Version conflict on {module_id}: {}", join(.requirements))]
    VersionConflict {
        module_id: ModuleId,
        requirements: Vec<Requirement>,
    },

    #[error("Operation already in progress for {module_id} (tenant {tenant_id})")]
    OperationInProgress {
        tenant_id: Uuid,
        module_id: ModuleId,
        operation_id: Option<Uuid>,
    },

    #[error("Module already installed: {0}")]
    AlreadyInstalled(ModuleId),

    #[error("Module not installed: {0}")]
    NotInstalled(ModuleId),

    #[error("Module {module_id} is required by: {}", join(.dependents))]
    RequiredBy {
        module_id: ModuleId,
        dependents: Vec<ModuleId>,
    },

    #[error("Module not found in catalog: {0}")]
    ModuleNotFound(ModuleId),

    #[error("Cannot {operation} {module_id} while it is {from}")]
    InvalidTransition {
        module_id: ModuleId,
        from: InstallationStatus,
        operation: OperationKind,
    },
}

impl ConflictError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CyclicDependency { .. } => codes::conflict::CYCLIC_DEPENDENCY,
            Self::VersionConflict { .. } => codes::conflict::VERSION_CONFLICT,
            Self::OperationInProgress { .. } => codes::conflict::OPERATION_IN_PROGRESS,
            Self::AlreadyInstalled(_) => codes::conflict::ALREADY_INSTALLED,
            Self::NotInstalled(_) => codes::conflict::NOT_INSTALLED,
            Self::RequiredBy { .. } => codes::conflict::REQUIRED_BY_DEPENDENTS,
            Self::ModuleNotFound(_) => codes::conflict::MODULE_NOT_FOUND,
            Self::InvalidTransition { .. } => codes::conflict::INVALID_TRANSITION,
        }
    }
}

/// Sandbox provisioning and backend failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Provisioning a {level} sandbox failed after {attempts} attempt(s): {reason}")]
    ProvisioningFailed {
        level: IsolationLevel,
        attempts: u32,
        reason: String,
    },

    #[error("No allowed isolation level satisfies {required}")]
    IsolationUnavailable { required: IsolationLevel },

    #[error("No sandbox backend registered for {0}")]
    BackendMissing(IsolationLevel),

    #[error("Sandbox backend error: {0}")]
    Backend(String),
}

impl ResourceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProvisioningFailed { .. } | Self::Backend(_) => codes::resource::PROVISIONING_FAILED,
            Self::IsolationUnavailable { .. } => codes::resource::ISOLATION_UNAVAILABLE,
            Self::BackendMissing(_) => codes::resource::BACKEND_MISSING,
        }
    }
}

/// Main lifecycle error type
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Security gate rejection, with per-category reasons
    #[error("Security scan rejected {module_id}@{version}: {}", .reasons.join("; "))]
    ScanFailure {
        module_id: ModuleId,
        version: String,
        reasons: Vec<String>,
    },

    #[error("Scanner unavailable: {0}")]
    ScannerUnavailable(String),

    #[error("Permission denied for {module_id}: {}", .denied.join(", "))]
    PermissionDenied {
        module_id: ModuleId,
        denied: Vec<String>,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Step '{step}' timed out after {after:?}")]
    Timeout { step: String, after: Duration },

    #[error("Operation {0} was cancelled")]
    Cancelled(Uuid),

    /// Storage or network hiccup
    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Package integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Compensation '{step}' exhausted its retry budget: {report}")]
    CompensationExhausted { step: String, report: ErrorReport },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A failure recorded by an earlier run of the same step
    #[error("{0}")]
    Recorded(ErrorReport),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl Classified for LifecycleError {
    fn code(&self) -> &str {
        match self {
            Self::Conflict(error) => error.code(),
            Self::ScanFailure { .. } => codes::security::SCAN_FAILURE,
            Self::ScannerUnavailable(_) => codes::security::SCANNER_UNAVAILABLE,
            Self::PermissionDenied { .. } => codes::authorization::PERMISSION_DENIED,
            Self::Resource(error) => error.code(),
            Self::Timeout { .. } => codes::transient::STEP_TIMEOUT,
            Self::Cancelled(_) => codes::lifecycle::CANCELLED,
            Self::Storage(_) => codes::transient::STORAGE_UNAVAILABLE,
            Self::IntegrityMismatch { .. } => codes::security::INTEGRITY_MISMATCH,
            Self::CompensationExhausted { .. } => codes::lifecycle::COMPENSATION_EXHAUSTED,
            Self::NotFound(_) => codes::lifecycle::NOT_FOUND,
            Self::InvalidState(_) => codes::lifecycle::INVALID_STATE,
            Self::Recorded(report) => report.code.as_str(),
            Self::Workflow(error) => error.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict(_) | Self::NotFound(_) | Self::InvalidState(_) | Self::Cancelled(_) => {
                ErrorClass::ClientCorrectable
            }
            Self::ScanFailure { .. } | Self::PermissionDenied { .. } | Self::IntegrityMismatch { .. } => {
                ErrorClass::PolicyRejection
            }
            Self::Resource(_) => ErrorClass::Resource,
            Self::ScannerUnavailable(_) | Self::Storage(_) | Self::Timeout { .. } => ErrorClass::Transient,
            Self::CompensationExhausted { .. } => ErrorClass::Internal,
            Self::Recorded(report) => report.class,
            Self::Workflow(error) => error.class(),
        }
    }
}

impl LifecycleError {
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Recorded(report) => report.code == codes::lifecycle::CANCELLED,
            _ => false,
        }
    }
}

impl From<StepError<LifecycleError>> for LifecycleError {
    fn from(error: StepError<LifecycleError>) -> Self {
        match error {
            StepError::Failed { source, .. } => source,
            StepError::TimedOut { step_id, after } => Self::Timeout { step: step_id, after },
            StepError::Replayed { report, .. } => Self::Recorded(report),
            StepError::Log(error) => Self::Workflow(error),
        }
    }
}

/// Lifecycle result type
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_lists_every_requester() {
        let error = ConflictError::VersionConflict {
            module_id: ModuleId::from("b"),
            requirements: vec![
                Requirement {
                    requester: "a@1.0.0".to_string(),
                    range: "^2.0".to_string(),
                },
                Requirement {
                    requester: "c@1.0.0".to_string(),
                    range: "^1.0".to_string(),
                },
            ],
        };
        let message = error.to_string();
        assert!(message.contains("a@1.0.0 requires ^2.0"));
        assert!(message.contains("c@1.0.0 requires ^1.0"));
    }

    #[test]
    fn test_classes_drive_retry() {
        assert!(LifecycleError::Storage("connection reset".into()).is_transient());
        assert!(!LifecycleError::IntegrityMismatch {
            expected: "aa".into(),
            actual: "bb".into()
        }
        .is_transient());
        let conflict = LifecycleError::from(ConflictError::AlreadyInstalled(ModuleId::from("a")));
        assert_eq!(conflict.class(), ErrorClass::ClientCorrectable);
        assert_eq!(conflict.code(), codes::conflict::ALREADY_INSTALLED);
    }

    #[test]
    fn test_replayed_step_keeps_original_code() {
        let report = ErrorReport {
            code: codes::security::SCAN_FAILURE.to_string(),
            class: ErrorClass::PolicyRejection,
            message: "malware".to_string(),
        };
        let error = LifecycleError::from(StepError::<LifecycleError>::Replayed {
            step_id: "gate".to_string(),
            report,
        });
        assert_eq!(error.code(), codes::security::SCAN_FAILURE);
        assert_eq!(error.class(), ErrorClass::PolicyRejection);
    }
}
