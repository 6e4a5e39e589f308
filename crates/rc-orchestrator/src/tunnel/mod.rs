//! SSH tunnel management
//!
//! The dashboard exposes remote services (the onboarding terminal, the agent
//! gateway) on local ports through `ssh -L` forwards. The [`TunnelManager`]
//! owns every forward the process starts, keyed by logical name.

mod forward;
mod manager;

pub use forward::{ForwardProcess, ForwardSpawner, ForwardSpec, SshForwarder};
pub use manager::{TunnelInfo, TunnelManager, TunnelSettings};

use thiserror::Error;

/// Tunnel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Every candidate port is taken
    #[error("No free local port in {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    /// A fixed local port is occupied
    #[error("Local port {0} is already in use")]
    PortInUse(u16),

    /// The forward never started listening
    #[error("Tunnel {key} failed to listen on local port {port}")]
    NotListening { key: String, port: u16 },

    /// The forward process could not be started
    #[error("Failed to start ssh: {0}")]
    Spawn(String),

    /// The tunnel was stopped while starting
    #[error("Tunnel {0} was stopped")]
    Stopped(String),
}
