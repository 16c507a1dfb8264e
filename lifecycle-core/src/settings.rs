//! Typed engine settings
//!
//! Loaded through [`ConfigEngine`]: serialized defaults, then optional
//! `modhost.yaml` / `modhost.toml`, then `MODHOST_*` environment variables
//! (`__` separates nested keys, e.g. `MODHOST_SANDBOX__VIOLATION_THRESHOLD`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config_engine::{ConfigEngine, ConfigSource};
use logger_redacted::LoggerConfig;
use serde::{Deserialize, Serialize};
use workflow_engine::{DurableExecutor, RetryPolicy, StepLog};

use crate::isolation::SandboxPolicy;
use crate::permissions::PermissionPolicy;
use crate::policy::TenantPolicy;
use crate::sandbox::SandboxConfig;
use crate::scan::ScanPolicy;

pub const ENV_PREFIX: &str = "MODHOST_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Wall-clock budget per forward step
    pub step_timeout_ms: u64,
    /// Retry for transient errors inside forward steps
    pub step_retry: RetryPolicy,
    /// Budget for each compensation before the operation is marked failed
    pub compensation_retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            step_retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::exponential(5, 100, 2_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// 0 disables background sampling
    pub sampling_interval_ms: u64,
    pub violation_threshold: u32,
    pub provision_attempts: u32,
    pub provision_backoff_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 5_000,
            violation_threshold: 3,
            provision_attempts: 3,
            provision_backoff_ms: 100,
        }
    }
}

impl SandboxSettings {
    pub fn manager_config(&self) -> SandboxConfig {
        SandboxConfig {
            sampling_interval: Duration::from_millis(self.sampling_interval_ms),
            violation_threshold: self.violation_threshold,
            provision_attempts: self.provision_attempts,
            provision_backoff: Duration::from_millis(self.provision_backoff_ms),
        }
    }
}

/// Platform defaults for tenants without an override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDefaults {
    pub sandbox: SandboxPolicy,
    pub permissions: PermissionPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub orchestrator: OrchestratorSettings,
    pub sandbox: SandboxSettings,
    pub scan: ScanPolicy,
    pub policy: PolicyDefaults,
    pub logging: LoggerConfig,
}

impl LifecycleSettings {
    /// Standard source stack rooted at `dir`
    pub fn engine(dir: impl AsRef<Path>) -> ConfigEngine {
        let dir = dir.as_ref();
        ConfigEngine::builder()
            .add_source(ConfigSource::file_optional(dir.join("modhost.yaml")))
            .add_source(ConfigSource::file_optional(dir.join("modhost.toml")))
            .add_source(ConfigSource::env(ENV_PREFIX))
            .build()
    }

    /// # Errors
    ///
    /// Missing required sources or values of the wrong shape.
    pub fn load(engine: &ConfigEngine) -> config_engine::Result<Self> {
        engine.extract_with_defaults()
    }

    /// Policy applied to tenants the policy store knows nothing about
    pub fn tenant_defaults(&self) -> TenantPolicy {
        TenantPolicy {
            scan: self.scan.clone(),
            sandbox: self.policy.sandbox.clone(),
            permissions: self.policy.permissions.clone(),
        }
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        (self.orchestrator.step_timeout_ms > 0).then(|| Duration::from_millis(self.orchestrator.step_timeout_ms))
    }

    /// Durable executor configured with the forward-step policy
    pub fn executor(&self, log: Arc<dyn StepLog>) -> DurableExecutor {
        let executor = DurableExecutor::new(log).with_retry_policy(self.orchestrator.step_retry.clone());
        match self.step_timeout() {
            Some(timeout) => executor.with_step_timeout(timeout),
            None => executor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::IsolationLevel;

    #[test]
    fn test_defaults_without_sources() {
        let settings = LifecycleSettings::load(&ConfigEngine::builder().build()).unwrap();
        assert_eq!(settings.sandbox.violation_threshold, 3);
        assert_eq!(settings.scan.min_score, 70);
        assert_eq!(settings.step_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_file_and_env_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "modhost.yaml",
                "sandbox:\n  sampling_interval_ms: 250\nscan:\n  min_score: 80\npolicy:\n  sandbox:\n    minimum_level: container\n",
            )?;
            jail.set_env("MODHOST_SANDBOX__VIOLATION_THRESHOLD", "7");
            jail.set_env("MODHOST_ORCHESTRATOR__STEP_TIMEOUT_MS", "0");

            let settings = LifecycleSettings::load(&LifecycleSettings::engine(jail.directory()))
                .map_err(|error| error.to_string())?;
            assert_eq!(settings.sandbox.sampling_interval_ms, 250);
            assert_eq!(settings.sandbox.violation_threshold, 7);
            assert_eq!(settings.scan.min_score, 80);
            assert_eq!(settings.policy.sandbox.minimum_level, IsolationLevel::Container);
            assert_eq!(settings.step_timeout(), None);
            assert_eq!(
                settings.sandbox.manager_config().sampling_interval,
                Duration::from_millis(250)
            );
            Ok(())
        });
    }
}
