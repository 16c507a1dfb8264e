pub mod config;
pub mod redactor;

pub use config::*;
pub use redactor::*;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Structured logging for the ModHost engine with secret redaction
///
/// Module installations carry tenant-supplied configuration blobs, and
/// provisioning errors routinely echo back connection strings and tokens.
/// This crate keeps both out of the logs and out of the error text recorded
/// on installation and operation records.
///
/// # Key Features
///
/// - **Subscriber Bootstrap**: `EnvFilter`-driven, pretty output for development
///   and JSON for production
/// - **JSON Redaction**: Values under sensitive keys (`password`, `token`,
///   `api_key`, ...) are replaced, recursively, in configuration blobs
/// - **Text Redaction**: Bearer tokens, `key=value` secrets, PEM private keys
///   and URL credentials are scrubbed from free text
/// - **Hash-based Correlation**: Redacted values can be replaced by a short
///   hash so two log lines about the same secret can still be correlated
///
/// # Example
///
/// ```rust
/// use logger_redacted::{RedactionConfig, SecretRedactor};
///
/// let redactor = SecretRedactor::new(RedactionConfig {
///     hash_for_correlation: false,
///     ..Default::default()
/// })
/// .unwrap();
///
/// let config = serde_json::json!({ "endpoint": "https://api.example.com", "api_key": "sk-123" });
/// let cleaned = redactor.redact_json(&config);
/// assert_eq!(cleaned["api_key"], "[REDACTED]");
/// assert_eq!(cleaned["endpoint"], "https://api.example.com");
/// ```
///
/// # Configuration
///
/// ```yaml
/// logging:
///   log_level: info
///   format: json
///   with_target: true
/// ```
///
/// Installs the global tracing subscriber described by `config`.
///
/// # Errors
///
/// Returns [`LoggerError::InvalidFilter`] when the level directive does not
/// parse and [`LoggerError::AlreadyInitialized`] when a global subscriber is
/// already set (tests commonly hit this).
pub fn init_tracing(config: &LoggerConfig) -> Result<(), LoggerError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| LoggerError::InvalidFilter(e.to_string()))?,
    };

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(config.with_target)
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_ansi(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(config.with_target)
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };

    result.map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
}

/// Logging bootstrap errors
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Global subscriber already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Invalid redaction pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
