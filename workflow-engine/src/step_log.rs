use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use error_common::ErrorReport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};

/// Outcome of a logged step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
}

/// One entry in the step log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub op_id: Uuid,
    pub step_id: String,
    pub outcome: StepOutcome,
    /// Serialized step output (completed steps only)
    pub output: Option<serde_json::Value>,
    /// Failure report (failed steps only)
    pub error: Option<ErrorReport>,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// An operation known to the step log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEntry {
    pub op_id: Uuid,
    pub kind: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl OperationEntry {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Persisted step log interface
#[async_trait]
pub trait StepLog: Send + Sync {
    /// Register an operation; re-opening an existing one is a no-op
    async fn open_operation(&self, op_id: Uuid, kind: &str) -> Result<()>;

    /// Mark an operation finished so the recovery sweep skips it
    async fn close_operation(&self, op_id: Uuid) -> Result<()>;

    /// Operations opened but never closed, oldest first
    async fn open_operations(&self) -> Result<Vec<OperationEntry>>;

    async fn operation(&self, op_id: Uuid) -> Result<Option<OperationEntry>>;

    async fn load_step(&self, op_id: Uuid, step_id: &str) -> Result<Option<StepRecord>>;

    /// Write (or overwrite) a step record
    async fn record_step(&self, record: StepRecord) -> Result<()>;

    /// Every step recorded for an operation, in recording order
    async fn steps(&self, op_id: Uuid) -> Result<Vec<StepRecord>>;
}

/// In-memory step log for testing and development
pub struct InMemoryStepLog {
    operations: Arc<DashMap<Uuid, OperationEntry>>,
    steps: Arc<DashMap<(Uuid, String), StepRecord>>,
}

impl InMemoryStepLog {
    pub fn new() -> Self {
        Self {
            operations: Arc::new(DashMap::new()),
            steps: Arc::new(DashMap::new()),
        }
    }

    /// Drop a step record, simulating a crash before the log write landed
    pub fn forget_step(&self, op_id: Uuid, step_id: &str) {
        self.steps.remove(&(op_id, step_id.to_string()));
    }
}

impl Default for InMemoryStepLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn open_operation(&self, op_id: Uuid, kind: &str) -> Result<()> {
        self.operations.entry(op_id).or_insert_with(|| OperationEntry {
            op_id,
            kind: kind.to_string(),
            opened_at: Utc::now(),
            closed_at: None,
        });
        Ok(())
    }

    async fn close_operation(&self, op_id: Uuid) -> Result<()> {
        let mut entry = self
            .operations
            .get_mut(&op_id)
            .ok_or(WorkflowError::OperationNotFound(op_id))?;
        if entry.closed_at.is_none() {
            entry.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn open_operations(&self) -> Result<Vec<OperationEntry>> {
        let mut open: Vec<OperationEntry> = self
            .operations
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.value().clone())
            .collect();
        open.sort_by_key(|entry| entry.opened_at);
        Ok(open)
    }

    async fn operation(&self, op_id: Uuid) -> Result<Option<OperationEntry>> {
        Ok(self.operations.get(&op_id).map(|entry| entry.value().clone()))
    }

    async fn load_step(&self, op_id: Uuid, step_id: &str) -> Result<Option<StepRecord>> {
        Ok(self
            .steps
            .get(&(op_id, step_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn record_step(&self, record: StepRecord) -> Result<()> {
        self.steps.insert((record.op_id, record.step_id.clone()), record);
        Ok(())
    }

    async fn steps(&self, op_id: Uuid) -> Result<Vec<StepRecord>> {
        let mut records: Vec<StepRecord> = self
            .steps
            .iter()
            .filter(|entry| entry.key().0 == op_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.recorded_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_close_operations() {
        let log = InMemoryStepLog::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        log.open_operation(first, "install").await.unwrap();
        log.open_operation(second, "update").await.unwrap();
        // Re-opening keeps the original entry
        log.open_operation(first, "ignored").await.unwrap();

        let open = log.open_operations().await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(log.operation(first).await.unwrap().unwrap().kind, "install");

        log.close_operation(first).await.unwrap();
        let open = log.open_operations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].op_id, second);

        assert!(matches!(
            log.close_operation(Uuid::new_v4()).await,
            Err(WorkflowError::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_step_records_are_keyed_by_operation_and_step() {
        let log = InMemoryStepLog::new();
        let op_id = Uuid::new_v4();

        log.record_step(StepRecord {
            op_id,
            step_id: "resolve".to_string(),
            outcome: StepOutcome::Completed,
            output: Some(serde_json::json!({"plan": []})),
            error: None,
            attempts: 1,
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

        assert!(log.load_step(op_id, "resolve").await.unwrap().is_some());
        assert!(log.load_step(op_id, "gate").await.unwrap().is_none());
        assert!(log.load_step(Uuid::new_v4(), "resolve").await.unwrap().is_none());

        log.forget_step(op_id, "resolve");
        assert!(log.steps(op_id).await.unwrap().is_empty());
    }
}
