use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::providers::{ConfigSource, FileFormat};

/// Layered configuration engine
#[derive(Debug, Clone)]
pub struct ConfigEngine {
    sources: Vec<ConfigSource>,
}

/// Builder collecting sources in override order
#[derive(Debug, Default)]
pub struct ConfigEngineBuilder {
    sources: Vec<ConfigSource>,
}

impl ConfigEngineBuilder {
    pub fn add_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(self) -> ConfigEngine {
        ConfigEngine { sources: self.sources }
    }
}

impl ConfigEngine {
    pub fn builder() -> ConfigEngineBuilder {
        ConfigEngineBuilder::default()
    }

    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// Figment with every source merged on top of `base`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SourceNotFound`] for a missing required file.
    pub fn figment(&self, base: Figment) -> Result<Figment> {
        let mut figment = base;
        for source in &self.sources {
            figment = match source {
                ConfigSource::File { path, format, required } => {
                    if !path.exists() {
                        if *required {
                            return Err(ConfigError::SourceNotFound(path.display().to_string()));
                        }
                        debug!(path = %path.display(), "optional configuration file absent, skipping");
                        continue;
                    }
                    match format {
                        FileFormat::Yaml => figment.merge(Yaml::file(path)),
                        FileFormat::Toml => figment.merge(Toml::file(path)),
                    }
                }
                ConfigSource::Env { prefix } => figment.merge(Env::prefixed(prefix).split("__")),
            };
        }
        Ok(figment)
    }

    /// Extract `T` from the sources alone
    ///
    /// # Errors
    ///
    /// Fails when a required source is missing or the merged document does
    /// not deserialize into `T`.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(self.figment(Figment::new())?.extract()?)
    }

    /// Extract `T`, starting from `T::default()` so sources only need to
    /// carry overrides
    ///
    /// # Errors
    ///
    /// Same as [`ConfigEngine::extract`].
    pub fn extract_with_defaults<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let base = Figment::from(Serialized::defaults(T::default()));
        Ok(self.figment(base)?.extract()?)
    }

    /// Extract the sub-tree at `key`, defaulting missing fields
    ///
    /// # Errors
    ///
    /// Same as [`ConfigEngine::extract`].
    pub fn extract_section<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let base = Figment::from(Serialized::default(key, T::default()));
        Ok(self.figment(base)?.extract_inner(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Limits {
        interval_ms: u64,
        threshold: u32,
        nested: Nested,
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Nested {
        attempts: u32,
    }

    #[test]
    fn test_missing_required_file() {
        let engine = ConfigEngine::builder()
            .add_source(ConfigSource::file("/definitely/not/here.yaml"))
            .build();
        let result: Result<Limits> = engine.extract_with_defaults();
        assert!(matches!(result, Err(ConfigError::SourceNotFound(_))));
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "threshold: 3\nnested:\n  attempts: 5").unwrap();

        let engine = ConfigEngine::builder()
            .add_source(ConfigSource::file(file.path()))
            .build();
        let limits: Limits = engine.extract_with_defaults().unwrap();
        assert_eq!(limits.threshold, 3);
        assert_eq!(limits.nested.attempts, 5);
        assert_eq!(limits.interval_ms, 0);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("limits.toml", "threshold = 2\ninterval_ms = 100")?;
            jail.set_env("LIMTEST_THRESHOLD", "9");
            jail.set_env("LIMTEST_NESTED__ATTEMPTS", "4");

            let engine = ConfigEngine::builder()
                .add_source(ConfigSource::file("limits.toml"))
                .add_source(ConfigSource::env("LIMTEST_"))
                .build();
            let limits: Limits = engine.extract_with_defaults().map_err(|e| e.to_string())?;
            assert_eq!(limits.threshold, 9);
            assert_eq!(limits.interval_ms, 100);
            assert_eq!(limits.nested.attempts, 4);
            Ok(())
        });
    }
}
