use base64::{engine::general_purpose, Engine as _};
use regex::{Captures, Regex};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::LoggerError;

const BEARER_PATTERN: &str = r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*";
const KEY_VALUE_PATTERN: &str =
    r#"(?i)\b(password|passwd|secret|token|api[_-]?key|access[_-]?key|private[_-]?key)\s*[=:]\s*("[^"]*"|'[^']*'|[^\s,;&]+)"#;
const PRIVATE_KEY_PATTERN: &str =
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----";
const URL_CREDENTIALS_PATTERN: &str = r"(?i)\b([a-z][a-z0-9+.\-]*://)([^:/@\s]+):([^@/\s]+)@";

/// Secret redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_bearer_tokens: bool,
    pub redact_key_values: bool,
    pub redact_private_keys: bool,
    pub redact_url_credentials: bool,
    pub hash_for_correlation: bool,
    /// JSON keys whose values are always replaced (case-insensitive substring match)
    pub sensitive_keys: Vec<String>,
    /// Extra (pattern, replacement) pairs applied to free text
    pub custom_patterns: Vec<(String, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_bearer_tokens: true,
            redact_key_values: true,
            redact_private_keys: true,
            redact_url_credentials: true,
            hash_for_correlation: true,
            sensitive_keys: ["password", "secret", "token", "api_key", "apikey", "private_key", "credential"]
                .iter()
                .map(|k| (*k).to_string())
                .collect(),
            custom_patterns: Vec::new(),
        }
    }
}

/// Redactor for configuration blobs and error text
#[derive(Debug, Clone)]
pub struct SecretRedactor {
    config: RedactionConfig,
    bearer: Regex,
    key_value: Regex,
    private_key: Regex,
    url_credentials: Regex,
    custom: Vec<(Regex, String)>,
}

impl SecretRedactor {
    /// # Errors
    ///
    /// Fails when a custom pattern is not a valid regex.
    pub fn new(config: RedactionConfig) -> Result<Self, LoggerError> {
        let custom = config
            .custom_patterns
            .iter()
            .map(|(pattern, replacement)| Ok((Regex::new(pattern)?, replacement.clone())))
            .collect::<Result<Vec<_>, LoggerError>>()?;

        Ok(Self {
            bearer: Regex::new(BEARER_PATTERN)?,
            key_value: Regex::new(KEY_VALUE_PATTERN)?,
            private_key: Regex::new(PRIVATE_KEY_PATTERN)?,
            url_credentials: Regex::new(URL_CREDENTIALS_PATTERN)?,
            custom,
            config,
        })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.redact_private_keys {
            result = self
                .private_key
                .replace_all(&result, |caps: &Captures| self.mask("KEY", &caps[0]))
                .to_string();
        }

        if self.config.redact_bearer_tokens {
            result = self
                .bearer
                .replace_all(&result, |caps: &Captures| format!("Bearer {}", self.mask("TOKEN", &caps[0])))
                .to_string();
        }

        if self.config.redact_key_values {
            result = self
                .key_value
                .replace_all(&result, |caps: &Captures| format!("{}={}", &caps[1], self.mask("SECRET", &caps[2])))
                .to_string();
        }

        if self.config.redact_url_credentials {
            result = self
                .url_credentials
                .replace_all(&result, |caps: &Captures| format!("{}{}:{}@", &caps[1], &caps[2], self.mask("PASS", &caps[3])))
                .to_string();
        }

        for (pattern, replacement) in &self.custom {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    /// Redact a JSON document, replacing values under sensitive keys and
    /// scrubbing every remaining string value as free text.
    pub fn redact_json(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, inner)| {
                        let cleaned = if self.is_sensitive_key(key) {
                            Value::String(self.mask_value(inner))
                        } else {
                            self.redact_json(inner)
                        };
                        (key.clone(), cleaned)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.redact_json(item)).collect()),
            Value::String(text) => Value::String(self.redact(text)),
            other => other.clone(),
        }
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase().replace('-', "_");
        self.config
            .sensitive_keys
            .iter()
            .any(|sensitive| key.contains(sensitive.as_str()))
    }

    fn mask_value(&self, value: &Value) -> String {
        match value {
            Value::String(s) => self.mask("SECRET", s),
            Value::Null => "[REDACTED]".to_string(),
            other => self.mask("SECRET", &other.to_string()),
        }
    }

    fn mask(&self, label: &str, value: &str) -> String {
        if self.config.hash_for_correlation {
            format!("{}[{}]", label, self.hash_value(value))
        } else {
            "[REDACTED]".to_string()
        }
    }

    fn hash_value(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        let result = hasher.finalize();
        general_purpose::STANDARD.encode(&result[..8]) // Use first 8 bytes for shorter hash
    }
}
