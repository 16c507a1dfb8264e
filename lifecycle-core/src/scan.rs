//! Security scan gate
//!
//! The gate runs each configured scan category through a pluggable
//! [`ScannerBackend`] and decides pass/fail against a tenant's
//! [`ScanPolicy`]:
//!
//! - Any failing non-advisory category fails the gate
//! - The aggregate score is the minimum over non-advisory categories and
//!   must reach `policy.min_score`
//! - Advisory categories are reported but never block
//!
//! Scan results are per version and shared across tenants. A cached result
//! is reused until a policy asks for a higher threshold than the one it was
//! produced under.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::model::{ModuleId, ModuleVersion};
use crate::storage::PackageStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanCategory {
    StaticAnalysis,
    DependencyVulnerability,
    Malware,
    License,
}

impl ScanCategory {
    pub const ALL: [ScanCategory; 4] = [
        Self::StaticAnalysis,
        Self::DependencyVulnerability,
        Self::Malware,
        Self::License,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaticAnalysis => "static_analysis",
            Self::DependencyVulnerability => "dependency_vulnerability",
            Self::Malware => "malware",
            Self::License => "license",
        }
    }
}

impl fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub passed: bool,
    /// 0..=100
    pub score: u8,
    pub findings: Vec<String>,
}

impl CategoryResult {
    pub fn clean() -> Self {
        Self {
            passed: true,
            score: 100,
            findings: Vec::new(),
        }
    }

    pub fn new(passed: bool, score: u8, findings: Vec<String>) -> Self {
        Self {
            passed,
            score: score.min(100),
            findings,
        }
    }
}

/// Stored per-version scan result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScanResult {
    pub categories: BTreeMap<ScanCategory, CategoryResult>,
    /// Every category passed
    pub passed: bool,
    /// Minimum over all categories
    pub score: u8,
    /// Highest policy threshold this result has been evaluated under
    pub evaluated_min_score: u8,
    pub scanned_at: DateTime<Utc>,
}

impl SecurityScanResult {
    pub fn new(categories: BTreeMap<ScanCategory, CategoryResult>, evaluated_min_score: u8) -> Self {
        let passed = categories.values().all(|result| result.passed);
        let score = categories.values().map(|result| result.score).min().unwrap_or(100);
        Self {
            categories,
            passed,
            score,
            evaluated_min_score,
            scanned_at: Utc::now(),
        }
    }

    /// Whether this result can stand in for a fresh scan under `policy`
    pub fn is_reusable_for(&self, policy: &ScanPolicy) -> bool {
        policy.min_score <= self.evaluated_min_score
            && policy
                .categories()
                .iter()
                .all(|category| self.categories.contains_key(category))
    }

    /// Malware category reported anything at all
    pub fn malware_flagged(&self) -> bool {
        self.categories
            .get(&ScanCategory::Malware)
            .is_some_and(|result| !result.findings.is_empty())
    }
}

/// Tenant or platform scan policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    pub min_score: u8,
    /// Categories reported but never blocking
    pub advisory: BTreeSet<ScanCategory>,
    /// Categories to run; empty means all
    pub run: BTreeSet<ScanCategory>,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            min_score: 70,
            advisory: BTreeSet::new(),
            run: BTreeSet::new(),
        }
    }
}

impl ScanPolicy {
    pub fn with_min_score(mut self, min_score: u8) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_advisory(mut self, category: ScanCategory) -> Self {
        self.advisory.insert(category);
        self
    }

    pub fn categories(&self) -> Vec<ScanCategory> {
        if self.run.is_empty() {
            ScanCategory::ALL.to_vec()
        } else {
            self.run.iter().copied().collect()
        }
    }

    pub fn is_advisory(&self, category: ScanCategory) -> bool {
        self.advisory.contains(&category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Pass,
    Fail(Vec<String>),
}

impl Decision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Gate outcome for one version under one policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub module_id: ModuleId,
    pub version: Version,
    pub decision: Decision,
    /// Minimum over non-advisory categories
    pub score: u8,
    pub malware_flagged: bool,
}

/// Scanner failure; always retryable
#[derive(Debug, Clone, thiserror::Error)]
#[error("scanner unavailable: {0}")]
pub struct ScanError(pub String);

impl From<ScanError> for LifecycleError {
    fn from(error: ScanError) -> Self {
        LifecycleError::ScannerUnavailable(error.0)
    }
}

/// External scan engine
#[async_trait]
pub trait ScannerBackend: Send + Sync {
    async fn scan(&self, package: &[u8], category: ScanCategory) -> std::result::Result<CategoryResult, ScanError>;
}

/// Apply `policy` to a scan result
pub fn evaluate_result(version: &ModuleVersion, result: &SecurityScanResult, policy: &ScanPolicy) -> GateVerdict {
    let mut reasons = Vec::new();
    let mut aggregate: Option<u8> = None;

    for category in policy.categories() {
        let Some(outcome) = result.categories.get(&category) else {
            reasons.push(format!("{category}: not scanned"));
            continue;
        };
        if policy.is_advisory(category) {
            if !outcome.passed {
                warn!(
                    module = %version.module_id,
                    version = %version.version,
                    category = %category,
                    "Advisory scan category failed"
                );
            }
            continue;
        }

        aggregate = Some(aggregate.map_or(outcome.score, |current| current.min(outcome.score)));
        if !outcome.passed {
            let findings = if outcome.findings.is_empty() {
                String::new()
            } else {
                format!(": {}", outcome.findings.join(", "))
            };
            reasons.push(format!("{category} failed (score {}){findings}", outcome.score));
        }
    }

    let score = aggregate.unwrap_or(100);
    if score < policy.min_score {
        reasons.push(format!("aggregate score {score} below minimum {}", policy.min_score));
    }

    GateVerdict {
        module_id: version.module_id.clone(),
        version: version.version.clone(),
        decision: if reasons.is_empty() {
            Decision::Pass
        } else {
            Decision::Fail(reasons)
        },
        score,
        malware_flagged: result.malware_flagged(),
    }
}

pub struct SecurityGate {
    scanner: Arc<dyn ScannerBackend>,
    storage: Arc<dyn PackageStorage>,
    cache: DashMap<(ModuleId, Version), SecurityScanResult>,
}

impl SecurityGate {
    pub fn new(scanner: Arc<dyn ScannerBackend>, storage: Arc<dyn PackageStorage>) -> Self {
        Self {
            scanner,
            storage,
            cache: DashMap::new(),
        }
    }

    /// Pass/fail decision for `version` under `policy`
    ///
    /// # Errors
    ///
    /// Scanner or storage failures; a rejection is a `Decision::Fail`, not an
    /// error.
    pub async fn evaluate(&self, version: &ModuleVersion, policy: &ScanPolicy) -> Result<Decision> {
        Ok(self.assess(version, policy).await?.decision)
    }

    /// Full verdict, including the malware flag used for isolation selection
    ///
    /// # Errors
    ///
    /// Same as [`SecurityGate::evaluate`].
    pub async fn assess(&self, version: &ModuleVersion, policy: &ScanPolicy) -> Result<GateVerdict> {
        let result = self.scan_result(version, policy).await?;
        let verdict = evaluate_result(version, &result, policy);

        let outcome = if verdict.decision.is_pass() { "pass" } else { "fail" };
        counter!("modhost_scan_decisions_total", "decision" => outcome).increment(1);
        info!(
            module = %version.module_id,
            version = %version.version,
            score = verdict.score,
            decision = outcome,
            "Security gate evaluated"
        );
        Ok(verdict)
    }

    /// Evaluate and turn a rejection into `ScanFailure`
    ///
    /// # Errors
    ///
    /// `ScanFailure` with per-category reasons, or scanner/storage failures.
    pub async fn require_pass(&self, version: &ModuleVersion, policy: &ScanPolicy) -> Result<GateVerdict> {
        let verdict = self.assess(version, policy).await?;
        match &verdict.decision {
            Decision::Pass => Ok(verdict),
            Decision::Fail(reasons) => Err(LifecycleError::ScanFailure {
                module_id: version.module_id.clone(),
                version: version.version.to_string(),
                reasons: reasons.clone(),
            }),
        }
    }

    pub fn cached(&self, module_id: &ModuleId, version: &Version) -> Option<SecurityScanResult> {
        self.cache
            .get(&(module_id.clone(), version.clone()))
            .map(|entry| entry.value().clone())
    }

    async fn scan_result(&self, version: &ModuleVersion, policy: &ScanPolicy) -> Result<SecurityScanResult> {
        let key = (version.module_id.clone(), version.version.clone());
        let cached = self
            .cache
            .get(&key)
            .map(|entry| entry.value().clone())
            .or_else(|| version.scan_result.clone());

        if let Some(result) = cached {
            if result.is_reusable_for(policy) {
                debug!(module = %version.module_id, version = %version.version, "Reusing scan result");
                return Ok(result);
            }
            debug!(
                module = %version.module_id,
                version = %version.version,
                cached_threshold = result.evaluated_min_score,
                policy_threshold = policy.min_score,
                "Cached scan result invalidated"
            );
        }

        let package = self.storage.fetch(&version.content_hash).await?;
        let mut categories = BTreeMap::new();
        for category in policy.categories() {
            let outcome = self.scanner.scan(&package, category).await?;
            categories.insert(category, outcome);
        }

        let result = SecurityScanResult::new(categories, policy.min_score);
        self.cache.insert(key, result.clone());
        Ok(result)
    }
}

/// Scripted scanner for testing and development
///
/// Unknown packages scan clean.
pub struct InMemoryScanner {
    results: DashMap<(String, ScanCategory), CategoryResult>,
    scans: AtomicU64,
}

impl InMemoryScanner {
    pub fn new() -> Self {
        Self {
            results: DashMap::new(),
            scans: AtomicU64::new(0),
        }
    }

    /// Script the result for a package (by content hash) and category
    pub fn set_result(&self, content_hash: impl Into<String>, category: ScanCategory, result: CategoryResult) {
        self.results.insert((content_hash.into(), category), result);
    }

    /// Number of category scans performed
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScannerBackend for InMemoryScanner {
    async fn scan(&self, package: &[u8], category: ScanCategory) -> std::result::Result<CategoryResult, ScanError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let hash = crate::storage::content_hash(package);
        Ok(self
            .results
            .get(&(hash, category))
            .map(|entry| entry.value().clone())
            .unwrap_or_else(CategoryResult::clean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryPackageStorage;

    struct Fixture {
        gate: SecurityGate,
        scanner: Arc<InMemoryScanner>,
        version: ModuleVersion,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryPackageStorage::new());
        let scanner = Arc::new(InMemoryScanner::new());
        let hash = storage.publish(b"payments module".to_vec());
        let version = ModuleVersion::new("payments", Version::new(1, 0, 0), hash);
        Fixture {
            gate: SecurityGate::new(scanner.clone(), storage),
            scanner,
            version,
        }
    }

    #[tokio::test]
    async fn test_low_malware_score_fails_gate() {
        let f = fixture();
        f.scanner.set_result(
            f.version.content_hash.clone(),
            ScanCategory::Malware,
            CategoryResult::new(true, 40, vec![]),
        );
        for category in [
            ScanCategory::StaticAnalysis,
            ScanCategory::DependencyVulnerability,
            ScanCategory::License,
        ] {
            f.scanner
                .set_result(f.version.content_hash.clone(), category, CategoryResult::new(true, 95, vec![]));
        }

        let verdict = f.gate.assess(&f.version, &ScanPolicy::default()).await.unwrap();
        assert_eq!(verdict.score, 40);
        match verdict.decision {
            Decision::Fail(reasons) => assert!(reasons[0].contains("aggregate score 40")),
            Decision::Pass => panic!("malware score 40 must fail"),
        }
    }

    #[tokio::test]
    async fn test_single_failing_category_fails_despite_scores() {
        let f = fixture();
        f.scanner.set_result(
            f.version.content_hash.clone(),
            ScanCategory::License,
            CategoryResult::new(false, 90, vec!["GPL-incompatible".into()]),
        );

        let error = f
            .gate
            .require_pass(&f.version, &ScanPolicy::default())
            .await
            .unwrap_err();
        match error {
            LifecycleError::ScanFailure { reasons, .. } => {
                assert_eq!(reasons, vec!["license failed (score 90): GPL-incompatible".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_advisory_category_does_not_block() {
        let f = fixture();
        f.scanner.set_result(
            f.version.content_hash.clone(),
            ScanCategory::Malware,
            CategoryResult::new(false, 10, vec!["heuristic: packed binary".into()]),
        );

        let policy = ScanPolicy::default().with_advisory(ScanCategory::Malware);
        let verdict = f.gate.assess(&f.version, &policy).await.unwrap();
        assert!(verdict.decision.is_pass());
        assert_eq!(verdict.score, 100);
        assert!(verdict.malware_flagged);
    }

    #[tokio::test]
    async fn test_cache_shared_until_threshold_rises() {
        let f = fixture();
        let policy = ScanPolicy::default().with_min_score(60);

        f.gate.assess(&f.version, &policy).await.unwrap();
        assert_eq!(f.scanner.scan_count(), 4);

        // Same or lower threshold reuses the result
        f.gate.assess(&f.version, &policy).await.unwrap();
        f.gate
            .assess(&f.version, &ScanPolicy::default().with_min_score(50))
            .await
            .unwrap();
        assert_eq!(f.scanner.scan_count(), 4);

        // A stricter tenant forces a rescan
        f.gate
            .assess(&f.version, &ScanPolicy::default().with_min_score(80))
            .await
            .unwrap();
        assert_eq!(f.scanner.scan_count(), 8);
        let cached = f.gate.cached(&f.version.module_id, &f.version.version).unwrap();
        assert_eq!(cached.evaluated_min_score, 80);
    }

    #[tokio::test]
    async fn test_catalog_result_seeds_cache() {
        let mut f = fixture();
        let categories = ScanCategory::ALL
            .into_iter()
            .map(|category| (category, CategoryResult::clean()))
            .collect();
        f.version.scan_result = Some(SecurityScanResult::new(categories, 90));

        let verdict = f.gate.assess(&f.version, &ScanPolicy::default()).await.unwrap();
        assert!(verdict.decision.is_pass());
        assert_eq!(f.scanner.scan_count(), 0);
    }
}
