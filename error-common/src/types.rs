use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification deciding how an error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The caller can fix the request; surfaced verbatim
    ClientCorrectable,
    /// A security or permission policy rejected the request
    PolicyRejection,
    /// Sandbox or capacity failure
    Resource,
    /// Storage/network hiccup, worth retrying with backoff
    Transient,
    /// Invariant violation or unexpected failure
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientCorrectable => "client_correctable",
            Self::PolicyRejection => "policy_rejection",
            Self::Resource => "resource",
            Self::Transient => "transient",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by errors that cross a workflow step boundary
pub trait Classified: std::error::Error {
    /// Stable error code from [`crate::codes`]
    fn code(&self) -> &str;

    /// Handling class
    fn class(&self) -> ErrorClass;

    /// Whether the substrate should retry the step that produced this error
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Serializable snapshot of a classified error, kept on records for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
}

impl ErrorReport {
    pub fn from_error<E: Classified + ?Sized>(error: &E) -> Self {
        Self {
            code: error.code().to_string(),
            class: error.class(),
            message: error.to_string(),
        }
    }

    /// Replace the message, keeping code and class
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Log a classified error with its code and class as structured fields
pub fn log_error<E: Classified + ?Sized>(context: &str, error: &E) {
    match error.class() {
        ErrorClass::Transient | ErrorClass::ClientCorrectable => tracing::warn!(
            context = context,
            error_code = error.code(),
            error_class = %error.class(),
            error = %error,
            "operation error"
        ),
        _ => tracing::error!(
            context = context,
            error_code = error.code(),
            error_class = %error.class(),
            error = %error,
            "operation error"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;

    #[derive(Debug, thiserror::Error)]
    #[error("sandbox backend refused: {0}")]
    struct Refused(String);

    impl Classified for Refused {
        fn code(&self) -> &str {
            codes::resource::PROVISIONING_FAILED
        }

        fn class(&self) -> ErrorClass {
            ErrorClass::Resource
        }
    }

    #[test]
    fn test_report_keeps_code_and_class() {
        let report = ErrorReport::from_error(&Refused("no capacity".to_string()));
        assert_eq!(report.code, codes::resource::PROVISIONING_FAILED);
        assert_eq!(report.class, ErrorClass::Resource);
        assert_eq!(report.message, "sandbox backend refused: no capacity");
        assert!(!Refused(String::new()).is_transient());
    }

    #[test]
    fn test_class_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorClass::ClientCorrectable).unwrap();
        assert_eq!(json, "\"client_correctable\"");
    }
}
