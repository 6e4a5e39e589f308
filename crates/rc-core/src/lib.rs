//! rc-core: Core abstractions and configuration for roboclaw-deploy
//!
//! This crate provides shared types, configuration structures, log redaction
//! and access to the per-instance YAML artifacts used by the dashboard.

pub mod artifact;
pub mod config;
pub mod error;
pub mod redact;
pub mod time;
pub mod types;

pub use error::{ArtifactError, ConfigError, RcError};
pub use redact::Redactor;
pub use types::{InstanceName, TunnelKey};
