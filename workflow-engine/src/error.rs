use std::time::Duration;

use error_common::{codes, Classified, ErrorClass, ErrorReport};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Operation not found in step log: {0}")]
    OperationNotFound(Uuid),

    #[error("Step log unavailable: {0}")]
    LogUnavailable(String),

    #[error("Step output serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classified for WorkflowError {
    fn code(&self) -> &str {
        match self {
            Self::OperationNotFound(_) | Self::LogUnavailable(_) => codes::internal::STEP_LOG,
            Self::Serialization(_) => codes::internal::SERIALIZATION,
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::LogUnavailable(_) => ErrorClass::Transient,
            _ => ErrorClass::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Failure of a single durable step
#[derive(Error, Debug)]
pub enum StepError<E>
where
    E: std::error::Error + 'static,
{
    /// The step body returned an error (after any retries)
    #[error("step '{step_id}' failed after {attempts} attempt(s): {source}")]
    Failed {
        step_id: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// An attempt exceeded the step's wall-clock budget
    #[error("step '{step_id}' timed out after {after:?}")]
    TimedOut { step_id: String, after: Duration },

    /// The step failed in an earlier run; the logged failure is replayed
    #[error("step '{step_id}' previously failed: {report}")]
    Replayed { step_id: String, report: ErrorReport },

    /// The step log itself failed
    #[error(transparent)]
    Log(#[from] WorkflowError),
}

impl<E> StepError<E>
where
    E: std::error::Error + 'static,
{
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::Failed { step_id, .. } | Self::TimedOut { step_id, .. } | Self::Replayed { step_id, .. } => {
                Some(step_id)
            }
            Self::Log(_) => None,
        }
    }
}

impl<E> StepError<E>
where
    E: Classified + 'static,
{
    /// Serializable report of this failure
    pub fn report(&self) -> ErrorReport {
        match self {
            Self::Failed { source, .. } => ErrorReport::from_error(source),
            Self::TimedOut { .. } => ErrorReport {
                code: codes::transient::STEP_TIMEOUT.to_string(),
                class: ErrorClass::Transient,
                message: self.to_string(),
            },
            Self::Replayed { report, .. } => report.clone(),
            Self::Log(error) => ErrorReport::from_error(error),
        }
    }
}
