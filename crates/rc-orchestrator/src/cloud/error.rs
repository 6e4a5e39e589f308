//! Cloud API errors

use std::time::Duration;
use thiserror::Error;

/// Provider code used when an error body carries no structured code
pub const UNKNOWN_CODE: &str = "unknown";

/// Errors returned by the cloud API client
#[derive(Error, Debug)]
pub enum CloudError {
    /// No response was received (DNS, connect, TLS, request timeout)
    #[error("Network error: {message}")]
    Network { message: String },

    /// The provider rejected the request
    #[error("Cloud API error ({status} {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// A success response could not be decoded
    #[error("Unexpected response from cloud API: {0}")]
    Decode(String),

    /// The server did not reach `running` in time
    #[error("Server {server_id} failed to start within {} seconds", .timeout.as_secs())]
    Timeout { server_id: u64, timeout: Duration },
}

impl CloudError {
    /// Provider error code (`network_error`, `timeout` or the provider's own)
    pub fn code(&self) -> &str {
        match self {
            CloudError::Network { .. } => "network_error",
            CloudError::Api { code, .. } => code,
            CloudError::Decode(_) => "invalid_response",
            CloudError::Timeout { .. } => "timeout",
        }
    }

    /// HTTP status, when a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is a name collision on create
    pub fn is_uniqueness_conflict(&self) -> bool {
        matches!(self, CloudError::Api { code, .. } if code == "uniqueness_error")
    }

    /// Whether the provider rejected the credential
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CloudError::Api { status: 401, .. })
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CloudError::Decode(e.to_string())
        } else {
            CloudError::Network {
                message: e.to_string(),
            }
        }
    }
}
