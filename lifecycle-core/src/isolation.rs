//! Isolation level selection
//!
//! The orchestrator picks a level before provisioning; the sandbox manager
//! only executes the decision.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ResourceError, Result};
use crate::model::RiskLevel;
use crate::sandbox::{IsolationLevel, ResourceLimits};

/// Tenant sandbox policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Levels the tenant may run modules under
    pub allowed_levels: Vec<IsolationLevel>,
    /// Floor applied regardless of declared risk
    pub minimum_level: IsolationLevel,
    /// Permit `IsolationLevel::None` for trusted modules
    pub allow_unisolated: bool,
    /// Upper bound for any requested limits
    pub ceiling: ResourceLimits,
    /// Limits for modules that request none
    pub default_limits: ResourceLimits,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_levels: vec![
                IsolationLevel::Process,
                IsolationLevel::Container,
                IsolationLevel::SandboxedRuntime,
            ],
            minimum_level: IsolationLevel::Process,
            allow_unisolated: false,
            ceiling: ResourceLimits {
                cpu_millis: 4_000,
                memory_bytes: 2 * 1024 * 1024 * 1024, // 2GB
                egress_bytes_per_sec: 16 * 1024 * 1024,
            },
            default_limits: ResourceLimits::default(),
        }
    }
}

impl SandboxPolicy {
    /// Effective limits: requested (or default) clamped to the ceiling
    pub fn limits_for(&self, requested: Option<&ResourceLimits>) -> ResourceLimits {
        requested.unwrap_or(&self.default_limits).clamp_to(&self.ceiling)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IsolationSelector;

impl IsolationSelector {
    pub fn new() -> Self {
        Self
    }

    /// Level a risk class needs before policy is applied
    pub fn baseline(risk: RiskLevel) -> IsolationLevel {
        match risk {
            RiskLevel::Trusted => IsolationLevel::None,
            RiskLevel::Low | RiskLevel::Medium => IsolationLevel::Process,
            RiskLevel::High => IsolationLevel::Container,
            RiskLevel::Critical => IsolationLevel::SandboxedRuntime,
        }
    }

    /// Pick the weakest allowed level that still meets every requirement
    ///
    /// Any malware signal forces `SandboxedRuntime` even when the scan
    /// passed overall.
    ///
    /// # Errors
    ///
    /// `IsolationUnavailable` when no allowed level is strong enough.
    pub fn select(&self, risk: RiskLevel, malware_flagged: bool, policy: &SandboxPolicy) -> Result<IsolationLevel> {
        let mut required = Self::baseline(risk).max(policy.minimum_level);
        if malware_flagged {
            required = IsolationLevel::SandboxedRuntime;
        }
        if required == IsolationLevel::None && !policy.allow_unisolated {
            required = IsolationLevel::Process;
        }

        let selected = policy
            .allowed_levels
            .iter()
            .copied()
            .filter(|level| *level >= required)
            .filter(|level| *level != IsolationLevel::None || policy.allow_unisolated)
            .min()
            .ok_or(ResourceError::IsolationUnavailable { required })?;

        debug!(risk = ?risk, malware = malware_flagged, required = %required, selected = %selected, "Isolation selected");
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;

    #[test]
    fn test_risk_maps_to_level() {
        let selector = IsolationSelector::new();
        let policy = SandboxPolicy::default();

        assert_eq!(selector.select(RiskLevel::Low, false, &policy).unwrap(), IsolationLevel::Process);
        assert_eq!(selector.select(RiskLevel::High, false, &policy).unwrap(), IsolationLevel::Container);
        assert_eq!(
            selector.select(RiskLevel::Critical, false, &policy).unwrap(),
            IsolationLevel::SandboxedRuntime
        );
    }

    #[test]
    fn test_malware_flag_forces_strongest_level() {
        let selector = IsolationSelector::new();
        assert_eq!(
            selector.select(RiskLevel::Low, true, &SandboxPolicy::default()).unwrap(),
            IsolationLevel::SandboxedRuntime
        );
    }

    #[test]
    fn test_unisolated_requires_permission() {
        let selector = IsolationSelector::new();
        let mut policy = SandboxPolicy {
            allowed_levels: IsolationLevel::ALL.to_vec(),
            minimum_level: IsolationLevel::None,
            ..SandboxPolicy::default()
        };
        assert_eq!(selector.select(RiskLevel::Trusted, false, &policy).unwrap(), IsolationLevel::Process);

        policy.allow_unisolated = true;
        assert_eq!(selector.select(RiskLevel::Trusted, false, &policy).unwrap(), IsolationLevel::None);
    }

    #[test]
    fn test_unavailable_level() {
        let policy = SandboxPolicy {
            allowed_levels: vec![IsolationLevel::Process],
            ..SandboxPolicy::default()
        };
        let error = IsolationSelector::new()
            .select(RiskLevel::High, false, &policy)
            .unwrap_err();
        assert!(matches!(
            error,
            LifecycleError::Resource(ResourceError::IsolationUnavailable {
                required: IsolationLevel::Container
            })
        ));
    }

    #[test]
    fn test_limits_are_clamped() {
        let policy = SandboxPolicy::default();
        let greedy = ResourceLimits {
            cpu_millis: 64_000,
            ..ResourceLimits::default()
        };
        assert_eq!(policy.limits_for(Some(&greedy)).cpu_millis, policy.ceiling.cpu_millis);
        assert_eq!(policy.limits_for(None), ResourceLimits::default());
    }
}
