//! Common error handling utilities for the ModHost engine
//!
//! This crate provides the error vocabulary shared by every ModHost crate.
//! Each crate keeps its own `thiserror` enum; what they share is:
//!
//! - **Error Codes**: Stable, machine-readable codes surfaced to the API layer
//! - **Error Classes**: A coarse classification that decides how an error is
//!   handled (surfaced verbatim, retried, or escalated to an operator)
//! - **The [`Classified`] trait**: Implemented by every error that crosses a
//!   workflow step boundary so the durable substrate can decide whether a
//!   failed step is worth retrying
//!
//! # Error Classes
//!
//! - **ClientCorrectable**: Conflicts the caller can fix (dependency cycles,
//!   unsatisfiable ranges, a concurrent operation already in flight)
//! - **PolicyRejection**: Security gate or permission policy said no
//! - **Resource**: Sandbox provisioning or capacity problems
//! - **Transient**: Storage or network hiccups, retried with backoff
//! - **Internal**: Bugs and invariant violations
//!
//! # Example
//!
//! ```rust
//! use error_common::{codes, Classified, ErrorClass};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("package storage unavailable")]
//! struct StorageDown;
//!
//! impl Classified for StorageDown {
//!     fn code(&self) -> &str {
//!         codes::transient::STORAGE_UNAVAILABLE
//!     }
//!
//!     fn class(&self) -> ErrorClass {
//!         ErrorClass::Transient
//!     }
//! }
//!
//! assert!(StorageDown.is_transient());
//! ```

pub mod codes;
pub mod types;

pub use types::*;
