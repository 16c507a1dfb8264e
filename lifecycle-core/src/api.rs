//! Request and status types exchanged with the API layer

use chrono::{DateTime, Utc};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ModuleId;
use crate::operation::{OperationKind, OperationRecord, OperationRequest, OperationStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    pub version_range: VersionReq,
    #[serde(default)]
    pub configuration: serde_json::Value,
    /// Go straight to `Active`; otherwise stop at `Installed`
    #[serde(default = "default_activate")]
    pub activate: bool,
    /// Optional dependencies to pull in with the module
    #[serde(default)]
    pub optional: Vec<ModuleId>,
}

fn default_activate() -> bool {
    true
}

impl InstallRequest {
    pub fn new(tenant_id: Uuid, module_id: impl Into<ModuleId>, version_range: VersionReq) -> Self {
        Self {
            tenant_id,
            module_id: module_id.into(),
            version_range,
            configuration: serde_json::Value::Null,
            activate: true,
            optional: Vec::new(),
        }
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn installed_only(mut self) -> Self {
        self.activate = false;
        self
    }

    pub fn with_optional(mut self, module_id: impl Into<ModuleId>) -> Self {
        self.optional.push(module_id.into());
        self
    }

    pub(crate) fn into_operation(self) -> (Uuid, ModuleId, OperationRequest) {
        (
            self.tenant_id,
            self.module_id,
            OperationRequest::Install {
                version_range: self.version_range,
                configuration: self.configuration,
                activate: self.activate,
                optional: self.optional,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    pub version_range: VersionReq,
    /// Replacement configuration; `None` keeps the current one
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
}

impl UpdateRequest {
    pub fn new(tenant_id: Uuid, module_id: impl Into<ModuleId>, version_range: VersionReq) -> Self {
        Self {
            tenant_id,
            module_id: module_id.into(),
            version_range,
            configuration: None,
        }
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub(crate) fn into_operation(self) -> (Uuid, ModuleId, OperationRequest) {
        (
            self.tenant_id,
            self.module_id,
            OperationRequest::Update {
                version_range: self.version_range,
                configuration: self.configuration,
            },
        )
    }
}

/// Caller-facing view of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatusView {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    pub status: OperationStatus,
    pub current_step: Option<u8>,
    pub step: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub compensation_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&OperationRecord> for OperationStatusView {
    fn from(record: &OperationRecord) -> Self {
        Self {
            operation_id: record.id,
            kind: record.kind,
            tenant_id: record.tenant_id,
            module_id: record.module_id.clone(),
            status: record.status,
            current_step: record.current_step,
            step: record.step_name.clone(),
            error: record.error.as_ref().map(|report| report.message.clone()),
            error_code: record.error.as_ref().map(|report| report.code.clone()),
            compensation_error: record
                .compensation_error
                .as_ref()
                .map(ToString::to_string),
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_request_defaults() {
        let json = serde_json::json!({
            "tenant_id": Uuid::nil(),
            "module_id": "crm",
            "version_range": "^1.0",
        });
        let request: InstallRequest = serde_json::from_value(json).unwrap();
        assert!(request.activate);
        assert!(request.optional.is_empty());

        let (_, module, operation) = request.installed_only().into_operation();
        assert_eq!(module, ModuleId::from("crm"));
        assert!(matches!(operation, OperationRequest::Install { activate: false, .. }));
    }
}
