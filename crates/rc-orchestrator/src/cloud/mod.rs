//! Cloud provider API
//!
//! A thin typed wrapper over the Hetzner Cloud REST API. The client holds no
//! per-deployment state: every call takes the caller's API token.

mod client;
mod error;
mod types;

pub use client::HcloudClient;
pub use error::{CloudError, UNKNOWN_CODE};
pub use types::{Ipv4, PublicNet, Server, ServerSpec, SshKey};

use async_trait::async_trait;
use std::time::Duration;

/// Callback receiving `Server status: <status>` on every poll
pub type ProgressFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Operations the deployment pipeline needs from a cloud provider
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Cheapest authenticated call; never errors
    async fn validate_credential(&self, token: &str) -> bool;

    /// Register an SSH key, returning the existing key on a name collision
    async fn create_ssh_key(
        &self,
        token: &str,
        name: &str,
        public_key: &str,
    ) -> Result<SshKey, CloudError>;

    /// Create and start a server without waiting for it
    async fn create_server(&self, token: &str, spec: &ServerSpec) -> Result<Server, CloudError>;

    async fn get_server(&self, token: &str, id: u64) -> Result<Server, CloudError>;

    /// Poll until the server reports `running` or `timeout` elapses
    async fn wait_for_server_running(
        &self,
        token: &str,
        id: u64,
        on_progress: ProgressFn<'_>,
        timeout: Duration,
    ) -> Result<(), CloudError>;

    async fn delete_server(&self, token: &str, id: u64) -> Result<(), CloudError>;

    async fn delete_ssh_key(&self, token: &str, id: u64) -> Result<(), CloudError>;
}
