//! Deployment errors

use thiserror::Error;

use crate::cloud::CloudError;
use crate::keygen::KeygenError;
use crate::remote::RemoteError;

/// Why a deployment run stopped
#[derive(Error, Debug)]
pub enum DeployError {
    /// Rejected before any remote resource was touched
    #[error("Invalid deployment request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Keygen(#[from] KeygenError),

    #[error("Cloud API error: {0}")]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The cloud reported a server without a public IPv4 address
    #[error("Server {0} has no public IPv4 address")]
    NoAddress(u64),

    /// A phase ran before the state it depends on was filled in
    #[error("Deployment state is missing {0}")]
    MissingState(&'static str),

    /// The provisioning script failed or could not be started
    #[error("{0}")]
    Script(String),
}
