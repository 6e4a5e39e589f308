//! Core error types for roboclaw-deploy

use rc_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type shared by the dashboard crates
#[derive(Error, Debug)]
pub enum RcError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Instance artifact error
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Rejected input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors reading or updating `instances/<name>.yml`
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// No artifact for this instance
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// Artifact exists but lacks a required field
    #[error("Instance {name} is missing field: {field}")]
    MissingField { name: String, field: &'static str },

    /// Artifact is not valid YAML or has an unexpected shape
    #[error("Malformed instance file {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
