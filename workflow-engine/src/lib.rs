//! Durable step execution for long-running ModHost operations
//!
//! This crate is the substrate lifecycle operations run on. It provides:
//! - A persisted step log keyed by (operation id, step id)
//! - At-least-once step execution: a step whose completion is already logged
//!   is never re-run, its recorded output is replayed instead
//! - Retry with backoff on transient step errors, bounded by a [`RetryPolicy`]
//! - A wall-clock budget per step; an overrun is a step failure
//! - An open-operation index so a recovery sweep can resume interrupted
//!   operations after a crash
//!
//! Steps must be idempotent: a crash between a side effect and the log
//! write re-executes the step on resume.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use workflow_engine::{DurableExecutor, InMemoryStepLog, RetryPolicy};
//! use uuid::Uuid;
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("never")]
//! # struct Never;
//! # impl error_common::Classified for Never {
//! #     fn code(&self) -> &str { "X" }
//! #     fn class(&self) -> error_common::ErrorClass { error_common::ErrorClass::Internal }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = DurableExecutor::new(Arc::new(InMemoryStepLog::new()))
//!         .with_retry_policy(RetryPolicy::default());
//!
//!     let op_id = Uuid::new_v4();
//!     executor.open(op_id, "install").await?;
//!
//!     let staged: String = executor
//!         .run_step(op_id, "stage", || async { Ok::<_, Never>("ref-1".to_string()) })
//!         .await?;
//!
//!     // Re-running the same step replays the logged output
//!     let replayed: String = executor
//!         .run_step(op_id, "stage", || async { Ok::<_, Never>("ref-2".to_string()) })
//!         .await?;
//!     assert_eq!(staged, replayed);
//!
//!     executor.close(op_id).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod executor;
pub mod retry;
pub mod step_log;

pub use error::*;
pub use executor::*;
pub use retry::*;
pub use step_log::*;
