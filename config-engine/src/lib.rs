//! Layered configuration management for the ModHost engine
//!
//! This crate loads typed settings from an ordered list of sources, each
//! one overriding the keys it defines:
//! - Serialized defaults of the target type
//! - Local files (YAML, TOML); missing optional files are skipped
//! - Environment variables with a prefix, `__` separating nested keys
//!
//! # Example
//!
//! ```rust
//! use config_engine::{ConfigEngine, ConfigSource};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct SandboxSettings {
//!     sampling_interval_ms: u64,
//!     violation_threshold: u32,
//! }
//!
//! let engine = ConfigEngine::builder()
//!     .add_source(ConfigSource::file_optional("modhost.yaml"))
//!     .add_source(ConfigSource::env("MODHOST_"))
//!     .build();
//!
//! let settings: SandboxSettings = engine.extract_with_defaults().unwrap();
//! assert_eq!(settings.violation_threshold, 0);
//! ```

pub mod engine;
pub mod error;
pub mod providers;

pub use engine::*;
pub use error::*;
pub use providers::*;
