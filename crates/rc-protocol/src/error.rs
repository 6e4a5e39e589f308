//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding stream events
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown phase identifier
    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    /// Step number outside 1..=12
    #[error("Invalid step number: {0}")]
    InvalidStep(u8),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
