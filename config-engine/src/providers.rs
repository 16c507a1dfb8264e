// Configuration providers (file, env)
use std::path::PathBuf;

/// File format, picked from the extension unless forced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Toml,
}

impl FileFormat {
    fn from_path(path: &std::path::Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

/// A single configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File {
        path: PathBuf,
        format: FileFormat,
        required: bool,
    },
    Env {
        prefix: String,
    },
}

impl ConfigSource {
    /// Required file; a missing file is an error at build time
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::File {
            format: FileFormat::from_path(&path),
            path,
            required: true,
        }
    }

    /// Optional file; skipped when absent
    pub fn file_optional(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::File {
            format: FileFormat::from_path(&path),
            path,
            required: false,
        }
    }

    /// Prefixed environment variables, `__` separating nested keys
    pub fn env(prefix: impl Into<String>) -> Self {
        Self::Env { prefix: prefix.into() }
    }
}
