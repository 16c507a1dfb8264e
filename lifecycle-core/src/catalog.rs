use std::sync::Arc;

use dashmap::DashMap;
use semver::Version;
use tracing::debug;

use crate::error::{LifecycleError, Result};
use crate::model::{Module, ModuleId, ModuleVersion};

/// Read access to published modules
///
/// Catalog reads are synchronous; the resolver calls them in tight loops.
pub trait ModuleCatalog: Send + Sync {
    fn module(&self, id: &ModuleId) -> Option<Module>;

    fn version(&self, id: &ModuleId, version: &Version) -> Option<ModuleVersion> {
        self.module(id).and_then(|module| module.version(version).cloned())
    }

    fn versions(&self, id: &ModuleId) -> Vec<ModuleVersion> {
        self.module(id).map(|module| module.versions).unwrap_or_default()
    }
}

/// In-memory catalog for testing and development
pub struct InMemoryCatalog {
    modules: Arc<DashMap<ModuleId, Module>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            modules: Arc::new(DashMap::new()),
        }
    }

    /// Register a module; existing entries keep their versions
    pub fn publish_module(&self, module: Module) {
        self.modules.entry(module.id.clone()).or_insert(module);
    }

    /// Append a release. Published versions are immutable.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the version is already published.
    pub fn publish_version(&self, version: ModuleVersion) -> Result<()> {
        let mut module = self
            .modules
            .entry(version.module_id.clone())
            .or_insert_with(|| Module::new(version.module_id.clone(), version.module_id.to_string()));

        if module.version(&version.version).is_some() {
            return Err(LifecycleError::InvalidState(format!(
                "{} is already published",
                version.label()
            )));
        }
        debug!(module = %version.module_id, version = %version.version, "Version published");
        module.versions.push(version);
        Ok(())
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleCatalog for InMemoryCatalog {
    fn module(&self, id: &ModuleId) -> Option<Module> {
        self.modules.get(id).map(|entry| entry.value().clone())
    }

    fn version(&self, id: &ModuleId, version: &Version) -> Option<ModuleVersion> {
        self.modules
            .get(id)
            .and_then(|entry| entry.value().version(version).cloned())
    }
}
