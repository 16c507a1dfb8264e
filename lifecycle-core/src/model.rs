//! Catalog and installation data model
//!
//! Catalog entries ([`Module`], [`ModuleVersion`]) are immutable once
//! published. [`ModuleInstallation`] is the only mutable, tenant-scoped
//! record; its status doubles as the per-(tenant, module) operation lock.

use std::fmt;

use chrono::{DateTime, Utc};
use error_common::ErrorReport;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permissions::PermissionRequest;
use crate::sandbox::{ResourceLimits, SandboxHandle};
use crate::scan::SecurityScanResult;
use crate::storage::StagedRef;

/// Stable catalog identifier of a module
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Immutable catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub category: String,
    pub author: String,
    /// Published releases, in publication order
    pub versions: Vec<ModuleVersion>,
}

impl Module {
    pub fn new(id: impl Into<ModuleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: "general".to_string(),
            author: "unknown".to_string(),
            versions: Vec::new(),
        }
    }

    pub fn version(&self, version: &Version) -> Option<&ModuleVersion> {
        self.versions.iter().find(|v| &v.version == version)
    }
}

/// Risk declared by the module author, used for isolation selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// First-party code the platform vouches for
    Trusted,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// A "requires" edge declared by a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub module_id: ModuleId,
    pub range: VersionReq,
    #[serde(default)]
    pub optional: bool,
}

impl DependencySpec {
    pub fn required(module_id: impl Into<ModuleId>, range: VersionReq) -> Self {
        Self {
            module_id: module_id.into(),
            range,
            optional: false,
        }
    }

    pub fn optional(module_id: impl Into<ModuleId>, range: VersionReq) -> Self {
        Self {
            module_id: module_id.into(),
            range,
            optional: true,
        }
    }
}

/// One immutable release of a module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub module_id: ModuleId,
    pub version: Version,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub required_permissions: Vec<PermissionRequest>,
    /// Hex SHA-256 of the package content
    pub content_hash: String,
    #[serde(default)]
    pub declared_risk: RiskLevel,
    /// Limits requested by the author; clamped to the tenant ceiling
    #[serde(default)]
    pub requested_limits: Option<ResourceLimits>,
    /// Present once the version has been scanned
    #[serde(default)]
    pub scan_result: Option<SecurityScanResult>,
}

impl ModuleVersion {
    pub fn new(module_id: impl Into<ModuleId>, version: Version, content_hash: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            version,
            dependencies: Vec::new(),
            required_permissions: Vec::new(),
            content_hash: content_hash.into(),
            declared_risk: RiskLevel::default(),
            requested_limits: None,
            scan_result: None,
        }
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_permission(mut self, permission: PermissionRequest) -> Self {
        self.required_permissions.push(permission);
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.declared_risk = risk;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.requested_limits = Some(limits);
        self
    }

    /// `module@version`, as used in conflict reports
    pub fn label(&self) -> String {
        format!("{}@{}", self.module_id, self.version)
    }
}

/// Lifecycle status of an installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    /// No installation row exists
    Available,
    Installing,
    Installed,
    Activating,
    Active,
    Deactivating,
    Inactive,
    Updating,
    Uninstalling,
    Failed,
    Suspended,
}

impl InstallationStatus {
    /// Statuses held while an operation owns the row
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Installing | Self::Activating | Self::Deactivating | Self::Updating | Self::Uninstalling
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Inactive => "inactive",
            Self::Updating => "updating",
            Self::Uninstalling => "uninstalling",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant-scoped installation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInstallation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub module_id: ModuleId,
    /// Committed version; `None` until the first install commits
    pub version: Option<Version>,
    pub status: InstallationStatus,
    /// Stable status the row held before the in-flight operation started
    pub prior_status: Option<InstallationStatus>,
    pub configuration: serde_json::Value,
    pub sandbox: Option<SandboxHandle>,
    pub staged: Option<StagedRef>,
    pub installed_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Operation currently holding the row
    pub active_operation: Option<Uuid>,
    pub last_operation: Option<Uuid>,
    /// Root cause kept for operator inspection
    pub last_error: Option<ErrorReport>,
}

impl ModuleInstallation {
    /// Row created when an install operation acquires the key
    pub fn reserved(tenant_id: Uuid, module_id: ModuleId, op_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            module_id,
            version: None,
            status: InstallationStatus::Installing,
            prior_status: None,
            configuration: serde_json::Value::Null,
            sandbox: None,
            staged: None,
            installed_at: None,
            activated_at: None,
            last_used_at: None,
            updated_at: Utc::now(),
            active_operation: Some(op_id),
            last_operation: Some(op_id),
            last_error: None,
        }
    }

    pub fn label(&self) -> String {
        match &self.version {
            Some(version) => format!("{}@{}", self.module_id, version),
            None => self.module_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_statuses() {
        let in_flight = [
            InstallationStatus::Installing,
            InstallationStatus::Activating,
            InstallationStatus::Deactivating,
            InstallationStatus::Updating,
            InstallationStatus::Uninstalling,
        ];
        for status in in_flight {
            assert!(status.is_in_flight(), "{status} should hold the lock");
        }
        for status in [
            InstallationStatus::Installed,
            InstallationStatus::Active,
            InstallationStatus::Inactive,
            InstallationStatus::Failed,
            InstallationStatus::Suspended,
        ] {
            assert!(!status.is_in_flight(), "{status} should not hold the lock");
        }
    }

    #[test]
    fn test_version_deserializes_with_defaults() {
        let json = serde_json::json!({
            "module_id": "billing",
            "version": "1.2.0",
            "content_hash": "ab",
            "dependencies": [{"module_id": "ledger", "range": "^1.0"}]
        });
        let version: ModuleVersion = serde_json::from_value(json).unwrap();
        assert_eq!(version.label(), "billing@1.2.0");
        assert!(!version.dependencies[0].optional);
        assert_eq!(version.declared_risk, RiskLevel::Low);
    }
}
