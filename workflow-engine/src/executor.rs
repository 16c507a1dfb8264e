use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use error_common::{codes, Classified, ErrorClass, ErrorReport};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StepError, WorkflowError};
use crate::retry::RetryPolicy;
use crate::step_log::{OperationEntry, StepLog, StepOutcome, StepRecord};

/// Per-call overrides for [`DurableExecutor::run_step_with`]
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Wall-clock budget per attempt; falls back to the executor default
    pub timeout: Option<Duration>,
    /// Retry policy; falls back to the executor default
    pub retry: Option<RetryPolicy>,
    /// Retry every error (timeouts included), not only transient ones
    pub retry_all: bool,
}

impl StepOptions {
    /// Options for compensation steps: any failure is retried within `policy`
    pub fn compensation(policy: RetryPolicy) -> Self {
        Self {
            timeout: None,
            retry: Some(policy),
            retry_all: true,
        }
    }
}

/// Runs named steps of an operation against a [`StepLog`]
///
/// A step is identified by `(op_id, step_id)`. The first run executes the
/// step body and records its outcome; later runs replay the recorded output
/// (or the recorded failure) without touching the body again.
#[derive(Clone)]
pub struct DurableExecutor {
    log: Arc<dyn StepLog>,
    retry: RetryPolicy,
    step_timeout: Option<Duration>,
}

impl DurableExecutor {
    pub fn new(log: Arc<dyn StepLog>) -> Self {
        Self {
            log,
            retry: RetryPolicy::default(),
            step_timeout: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn log(&self) -> &Arc<dyn StepLog> {
        &self.log
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Register an operation in the open-operation index
    pub async fn open(&self, op_id: Uuid, kind: &str) -> Result<()> {
        self.log.open_operation(op_id, kind).await?;
        debug!(op_id = %op_id, kind = kind, "Operation opened");
        Ok(())
    }

    /// Close an operation once it reached a terminal state
    pub async fn close(&self, op_id: Uuid) -> Result<()> {
        self.log.close_operation(op_id).await?;
        debug!(op_id = %op_id, "Operation closed");
        Ok(())
    }

    /// Operations that were opened but never closed
    pub async fn open_operations(&self) -> Result<Vec<OperationEntry>> {
        self.log.open_operations().await
    }

    /// Whether a step already has a recorded outcome
    pub async fn is_recorded(&self, op_id: Uuid, step_id: &str) -> Result<bool> {
        Ok(self.log.load_step(op_id, step_id).await?.is_some())
    }

    /// Run a step with the executor defaults
    pub async fn run_step<T, E, F, Fut>(
        &self,
        op_id: Uuid,
        step_id: &str,
        f: F,
    ) -> std::result::Result<T, StepError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Classified + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.run_step_with(op_id, step_id, StepOptions::default(), f).await
    }

    /// Run a step with explicit timeout and retry options
    pub async fn run_step_with<T, E, F, Fut>(
        &self,
        op_id: Uuid,
        step_id: &str,
        options: StepOptions,
        mut f: F,
    ) -> std::result::Result<T, StepError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Classified + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(record) = self.log.load_step(op_id, step_id).await? {
            return match record.outcome {
                StepOutcome::Completed => {
                    debug!(op_id = %op_id, step = step_id, "Replaying completed step");
                    let value = record.output.unwrap_or(serde_json::Value::Null);
                    Ok(serde_json::from_value(value).map_err(WorkflowError::from)?)
                }
                StepOutcome::Failed => {
                    debug!(op_id = %op_id, step = step_id, "Replaying failed step");
                    let report = record.error.unwrap_or_else(|| ErrorReport {
                        code: codes::internal::STEP_LOG.to_string(),
                        class: ErrorClass::Internal,
                        message: "failure recorded without a report".to_string(),
                    });
                    Err(StepError::Replayed {
                        step_id: step_id.to_string(),
                        report,
                    })
                }
            };
        }

        let policy = options.retry.unwrap_or_else(|| self.retry.clone());
        let timeout = options.timeout.or(self.step_timeout);
        let max_attempts = policy.attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, f()).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                },
                None => Some(f().await),
            };

            match outcome {
                Some(Ok(output)) => {
                    let value = serde_json::to_value(&output).map_err(WorkflowError::from)?;
                    self.log
                        .record_step(StepRecord {
                            op_id,
                            step_id: step_id.to_string(),
                            outcome: StepOutcome::Completed,
                            output: Some(value),
                            error: None,
                            attempts: attempt,
                            recorded_at: Utc::now(),
                        })
                        .await?;
                    debug!(op_id = %op_id, step = step_id, attempts = attempt, "Step completed");
                    return Ok(output);
                }
                Some(Err(error)) => {
                    let retryable = options.retry_all || error.is_transient();
                    if retryable && attempt < max_attempts {
                        let delay = policy.delay_for(attempt);
                        warn!(
                            op_id = %op_id,
                            step = step_id,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.record_failure(op_id, step_id, ErrorReport::from_error(&error), attempt)
                        .await?;
                    return Err(StepError::Failed {
                        step_id: step_id.to_string(),
                        attempts: attempt,
                        source: error,
                    });
                }
                None => {
                    // Only reachable with a timeout configured
                    let after = timeout.unwrap_or_default();
                    if options.retry_all && attempt < max_attempts {
                        warn!(op_id = %op_id, step = step_id, attempt = attempt, "Step timed out, retrying");
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                        continue;
                    }

                    let error: StepError<E> = StepError::TimedOut {
                        step_id: step_id.to_string(),
                        after,
                    };
                    self.record_failure(op_id, step_id, error.report(), attempt).await?;
                    return Err(error);
                }
            }
        }
    }

    async fn record_failure(
        &self,
        op_id: Uuid,
        step_id: &str,
        report: ErrorReport,
        attempts: u32,
    ) -> Result<()> {
        info!(
            op_id = %op_id,
            step = step_id,
            attempts = attempts,
            error_code = %report.code,
            "Step failed"
        );
        self.log
            .record_step(StepRecord {
                op_id,
                step_id: step_id.to_string(),
                outcome: StepOutcome::Failed,
                output: None,
                error: Some(report),
                attempts,
                recorded_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_log::InMemoryStepLog;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum ProbeError {
        #[error("storage hiccup")]
        Flaky,
        #[error("request rejected")]
        Rejected,
    }

    impl Classified for ProbeError {
        fn code(&self) -> &str {
            match self {
                Self::Flaky => codes::transient::STORAGE_UNAVAILABLE,
                Self::Rejected => codes::conflict::VERSION_CONFLICT,
            }
        }

        fn class(&self) -> ErrorClass {
            match self {
                Self::Flaky => ErrorClass::Transient,
                Self::Rejected => ErrorClass::ClientCorrectable,
            }
        }
    }

    fn executor() -> DurableExecutor {
        DurableExecutor::new(Arc::new(InMemoryStepLog::new()))
            .with_retry_policy(RetryPolicy::exponential(3, 1, 5))
    }

    #[tokio::test]
    async fn test_completed_step_is_replayed_without_running() {
        let executor = executor();
        let op_id = Uuid::new_v4();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value: u32 = executor
                .run_step(op_id, "stage", move || {
                    let calls = calls.clone();
                    async move { Ok::<_, ProbeError>(calls.fetch_add(1, Ordering::SeqCst) + 10) }
                })
                .await
                .unwrap();
            assert_eq!(value, 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let executor = executor();
        let op_id = Uuid::new_v4();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value: String = executor
            .run_step(op_id, "fetch", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProbeError::Flaky)
                    } else {
                        Ok("fetched".to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "fetched");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let record = executor.log().load_step(op_id, "fetch").await.unwrap().unwrap();
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_retry_is_bounded() {
        let executor = executor();
        let op_id = Uuid::new_v4();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: std::result::Result<(), _> = executor
            .run_step(op_id, "fetch", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProbeError::Flaky)
                }
            })
            .await;

        assert!(matches!(result, Err(StepError::Failed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_once_and_replays() {
        let executor = executor();
        let op_id = Uuid::new_v4();
        let calls = Arc::new(AtomicU32::new(0));

        for round in 0..2 {
            let counter = calls.clone();
            let result: std::result::Result<(), _> = executor
                .run_step(op_id, "resolve", move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ProbeError::Rejected)
                    }
                })
                .await;

            let error = result.unwrap_err();
            assert_eq!(error.report().code, codes::conflict::VERSION_CONFLICT);
            if round == 0 {
                assert!(matches!(error, StepError::Failed { attempts: 1, .. }));
            } else {
                assert!(matches!(error, StepError::Replayed { .. }));
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_timeout_is_a_failure() {
        let executor = executor().with_step_timeout(Duration::from_millis(20));
        let op_id = Uuid::new_v4();

        let result: std::result::Result<(), StepError<ProbeError>> = executor
            .run_step(op_id, "provision", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        let error = result.unwrap_err();
        assert!(matches!(error, StepError::TimedOut { .. }));
        assert_eq!(error.report().code, codes::transient::STEP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_compensation_options_retry_every_error() {
        let executor = executor();
        let op_id = Uuid::new_v4();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: std::result::Result<(), _> = executor
            .run_step_with(
                op_id,
                "compensate:stage",
                StepOptions::compensation(RetryPolicy::exponential(4, 1, 2)),
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                            Err(ProbeError::Rejected)
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_open_operations_index() {
        let executor = executor();
        let op_id = Uuid::new_v4();

        executor.open(op_id, "install").await.unwrap();
        assert_eq!(executor.open_operations().await.unwrap().len(), 1);
        assert!(!executor.is_recorded(op_id, "resolve").await.unwrap());

        executor.close(op_id).await.unwrap();
        assert!(executor.open_operations().await.unwrap().is_empty());
    }
}
