//! Package storage collaborator
//!
//! Published packages are addressed by the hex SHA-256 of their content.
//! Staging copies a package into an operation-private area keyed by a
//! caller-supplied idempotency key, so re-staging after a crash returns the
//! same reference instead of a second copy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{LifecycleError, Result};

/// Reference to staged package content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagedRef {
    pub reference: String,
    pub content_hash: String,
}

/// Hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check `bytes` against an expected hex digest
///
/// # Errors
///
/// `IntegrityMismatch` carrying both digests.
pub fn verify_content(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = content_hash(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(LifecycleError::IntegrityMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[async_trait]
pub trait PackageStorage: Send + Sync {
    /// Published package content
    async fn fetch(&self, content_hash: &str) -> Result<Vec<u8>>;

    /// Stage a package under `key`; staging the same key twice is a no-op
    async fn stage(&self, content_hash: &str, key: &str) -> Result<StagedRef>;

    async fn read_staged(&self, staged: &StagedRef) -> Result<Vec<u8>>;

    /// Remove staged content; unknown references are a no-op
    async fn unstage(&self, staged: &StagedRef) -> Result<()>;
}

/// In-memory package storage for testing and development
pub struct InMemoryPackageStorage {
    packages: Arc<DashMap<String, Vec<u8>>>,
    staged: Arc<DashMap<String, (String, Vec<u8>)>>,
    outages: AtomicU32,
}

impl InMemoryPackageStorage {
    pub fn new() -> Self {
        Self {
            packages: Arc::new(DashMap::new()),
            staged: Arc::new(DashMap::new()),
            outages: AtomicU32::new(0),
        }
    }

    /// Store a package and return its content hash
    pub fn publish(&self, bytes: impl Into<Vec<u8>>) -> String {
        let bytes = bytes.into();
        let hash = content_hash(&bytes);
        self.packages.insert(hash.clone(), bytes);
        hash
    }

    /// Store content under an arbitrary hash, e.g. to model a corrupted blob
    pub fn publish_as(&self, content_hash: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.packages.insert(content_hash.into(), bytes.into());
    }

    /// Fail the next `count` calls with a transient storage error
    pub fn fail_next(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn is_staged(&self, staged: &StagedRef) -> bool {
        self.staged.contains_key(&staged.reference)
    }

    fn check_outage(&self) -> Result<()> {
        let tripped = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(LifecycleError::Storage("package store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryPackageStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageStorage for InMemoryPackageStorage {
    async fn fetch(&self, content_hash: &str) -> Result<Vec<u8>> {
        self.check_outage()?;
        self.packages
            .get(content_hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LifecycleError::NotFound(format!("package {content_hash}")))
    }

    async fn stage(&self, content_hash: &str, key: &str) -> Result<StagedRef> {
        self.check_outage()?;
        let staged = StagedRef {
            reference: format!("staged/{key}"),
            content_hash: content_hash.to_string(),
        };
        if self.staged.contains_key(&staged.reference) {
            return Ok(staged);
        }

        let bytes = self
            .packages
            .get(content_hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LifecycleError::NotFound(format!("package {content_hash}")))?;
        self.staged
            .insert(staged.reference.clone(), (content_hash.to_string(), bytes));
        debug!(reference = %staged.reference, "Package staged");
        Ok(staged)
    }

    async fn read_staged(&self, staged: &StagedRef) -> Result<Vec<u8>> {
        self.staged
            .get(&staged.reference)
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| LifecycleError::NotFound(format!("staged {}", staged.reference)))
    }

    async fn unstage(&self, staged: &StagedRef) -> Result<()> {
        self.check_outage()?;
        if self.staged.remove(&staged.reference).is_some() {
            debug!(reference = %staged.reference, "Package unstaged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_is_idempotent_per_key() {
        let storage = InMemoryPackageStorage::new();
        let hash = storage.publish(b"module bytes".to_vec());

        let first = storage.stage(&hash, "op-1/ledger").await.unwrap();
        let second = storage.stage(&hash, "op-1/ledger").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.staged_count(), 1);

        storage.unstage(&first).await.unwrap();
        storage.unstage(&first).await.unwrap();
        assert_eq!(storage.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_integrity_check() {
        let storage = InMemoryPackageStorage::new();
        let hash = storage.publish(b"genuine".to_vec());
        storage.publish_as("deadbeef", b"tampered".to_vec());

        let genuine = storage.stage(&hash, "k1").await.unwrap();
        let bytes = storage.read_staged(&genuine).await.unwrap();
        assert!(verify_content(&bytes, &hash).is_ok());

        let tampered = storage.stage("deadbeef", "k2").await.unwrap();
        let bytes = storage.read_staged(&tampered).await.unwrap();
        assert!(matches!(
            verify_content(&bytes, "deadbeef"),
            Err(LifecycleError::IntegrityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_outages_are_transient() {
        use error_common::Classified;

        let storage = InMemoryPackageStorage::new();
        let hash = storage.publish(b"x".to_vec());
        storage.fail_next(1);

        let error = storage.fetch(&hash).await.unwrap_err();
        assert!(error.is_transient());
        assert!(storage.fetch(&hash).await.is_ok());
    }
}
