//! Provider resource types

use serde::{Deserialize, Serialize};

/// An SSH key registered with the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub public_key: String,
}

/// A server as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub public_net: PublicNet,
}

impl Server {
    /// Public IPv4 address, if one is assigned
    pub fn ip(&self) -> Option<&str> {
        self.public_net
            .ipv4
            .as_ref()
            .map(|v4| v4.ip.as_str())
            .filter(|ip| !ip.is_empty())
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4 {
    pub ip: String,
}

/// Parameters of a server creation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSpec {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_keys: Vec<u64>,
}

#[derive(Serialize)]
pub(crate) struct CreateServerBody<'a> {
    #[serde(flatten)]
    pub spec: &'a ServerSpec,
    pub start_after_create: bool,
}

#[derive(Serialize)]
pub(crate) struct CreateSshKeyBody<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct SshKeyEnvelope {
    pub ssh_key: SshKey,
}

#[derive(Deserialize)]
pub(crate) struct SshKeyList {
    pub ssh_keys: Vec<SshKey>,
}

#[derive(Deserialize)]
pub(crate) struct ServerEnvelope {
    pub server: Server,
}

/// `{"error": {"code": ..., "message": ...}}`
#[derive(Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Deserialize)]
pub(crate) struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
}
