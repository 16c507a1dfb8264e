//! Module lifecycle orchestration for multi-tenant ModHost deployments
//!
//! Tenants install, update, activate, deactivate and uninstall modules.
//! Every operation is a compensated sequence of durable steps:
//! - [`resolver`]: dependency plans in install order, with conflicts and cycles reported by name
//! - [`scan`]: the security gate, scored per category with results cached per version
//! - [`permissions`]: per-tenant policy rules and grant bookkeeping
//! - [`sandbox`] / [`isolation`]: isolation level selection, provisioning and resource monitoring
//! - [`orchestrator`]: the saga that ties them together and rolls back on failure
//!
//! Storage seams ([`store`], [`catalog`], [`storage`], [`policy`]) are traits
//! with in-memory adapters for tests and single-node development.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lifecycle_core::{
//!     InMemoryCatalog, InMemoryPackageStorage, InMemoryScanner, InstallRequest, LifecycleOrchestrator,
//!     ModuleVersion, OperationStatus,
//! };
//! use semver::{Version, VersionReq};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(InMemoryPackageStorage::new());
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     let hash = storage.publish(b"crm package".to_vec());
//!     catalog.publish_version(ModuleVersion::new("crm", Version::new(1, 0, 0), hash))?;
//!
//!     let orchestrator = LifecycleOrchestrator::builder(catalog, storage, Arc::new(InMemoryScanner::new())).build()?;
//!
//!     let tenant = Uuid::new_v4();
//!     let op = orchestrator
//!         .start_install(InstallRequest::new(tenant, "crm", VersionReq::parse("^1.0")?))
//!         .await?;
//!     let status = orchestrator.wait(op, Duration::from_secs(5)).await?;
//!     assert_eq!(status.status, OperationStatus::Succeeded);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod catalog;
pub mod error;
pub mod isolation;
pub mod model;
pub mod operation;
pub mod orchestrator;
pub mod permissions;
pub mod policy;
pub mod process;
pub mod resolver;
pub mod sandbox;
pub mod scan;
pub mod settings;
pub mod storage;
pub mod store;

pub use api::{InstallRequest, OperationStatusView, UpdateRequest};
pub use catalog::{InMemoryCatalog, ModuleCatalog};
pub use error::{ConflictError, LifecycleError, ResourceError, Result};
pub use isolation::{IsolationSelector, SandboxPolicy};
pub use model::{
    DependencySpec, InstallationStatus, Module, ModuleId, ModuleInstallation, ModuleVersion, RiskLevel,
};
pub use operation::{OperationKind, OperationRecord, OperationStatus};
pub use orchestrator::{LifecycleOrchestrator, LifecycleOrchestratorBuilder};
pub use permissions::{
    GrantMode, GrantStore, InMemoryGrantStore, PermissionGrant, PermissionPolicy, PermissionRequest, PermissionRule,
    PermissionType,
};
pub use policy::{InMemoryPolicyStore, PolicyStore, TenantPolicy};
pub use process::ProcessBackend;
pub use resolver::{DependencyResolver, Plan, PlanAction, PlanEntry, ResolveRequest};
pub use sandbox::{
    InMemoryBackend, IsolationLevel, ResourceLimits, ResourceViolation, SandboxBackend, SandboxHandle,
    SandboxManager, UsageSnapshot,
};
pub use scan::{CategoryResult, InMemoryScanner, ScanCategory, ScanPolicy, ScannerBackend, SecurityGate};
pub use settings::LifecycleSettings;
pub use storage::{InMemoryPackageStorage, PackageStorage};
pub use store::{InMemoryInstallationStore, InMemoryOperationStore, InstallationStore, OperationStore};
