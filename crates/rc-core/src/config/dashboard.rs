//! Dashboard configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the dashboard server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Address the HTTP API binds to
    pub bind_address: String,

    /// Root of the deployment project (instances, keys, scripts)
    pub project_root: PathBuf,

    /// Instance artifact directory, relative to `project_root` unless absolute
    pub instances_dir: PathBuf,

    /// Deployment transcript directory, relative to `project_root` unless absolute
    pub logs_dir: PathBuf,

    /// Provisioning script, relative to `project_root` unless absolute
    pub provision_script: PathBuf,

    /// How long open streams may keep the server alive after a shutdown signal
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    pub cloud: CloudConfig,
    pub deploy: DeployDefaults,
    pub tunnel: TunnelConfig,
    pub onboarding: OnboardingConfig,
    pub service: ServiceConfig,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            project_root: PathBuf::from("."),
            instances_dir: PathBuf::from("instances"),
            logs_dir: PathBuf::from("deployment-logs"),
            provision_script: PathBuf::from("run-hetzner.sh"),
            shutdown_grace: Duration::from_secs(5),
            cloud: CloudConfig::default(),
            deploy: DeployDefaults::default(),
            tunnel: TunnelConfig::default(),
            onboarding: OnboardingConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl DashboardConfig {
    /// Resolve a configured path against the project root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Absolute instance artifact directory
    pub fn instances_path(&self) -> PathBuf {
        self.resolve(&self.instances_dir)
    }

    /// Absolute transcript directory
    pub fn logs_path(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    /// Absolute provisioning script path
    pub fn script_path(&self) -> PathBuf {
        self.resolve(&self.provision_script)
    }
}

/// Cloud provider API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Base URL of the provider REST API
    pub api_base: String,

    /// Interval between server status polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// How long to wait for a new server to reach `running`
    #[serde(with = "duration_secs")]
    pub server_timeout: Duration,

    /// Per-request timeout
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.hetzner.cloud/v1".to_string(),
            poll_interval: Duration::from_secs(3),
            server_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Deployment defaults and remote connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployDefaults {
    /// Prefix for generated server names
    pub name_prefix: String,
    pub server_type: String,
    pub location: String,
    pub image: String,

    pub ssh_port: u16,
    pub ssh_user: String,

    /// Interval between SSH port probes
    #[serde(with = "duration_secs")]
    pub ssh_poll_interval: Duration,

    /// How long to wait for the SSH port to open
    #[serde(with = "duration_secs")]
    pub ssh_timeout: Duration,

    /// Authenticated connection attempts before giving up
    pub connect_retries: u32,

    /// Delay between connection attempts
    #[serde(with = "duration_secs")]
    pub connect_backoff: Duration,

    /// Bound on each SSH handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Interval between heartbeat events
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Check the API token before opening the event stream
    pub validate_credential: bool,

    /// Bound on a script-driven deployment
    #[serde(with = "duration_secs")]
    pub provision_timeout: Duration,
}

impl Default for DeployDefaults {
    fn default() -> Self {
        Self {
            name_prefix: "roboclaw".to_string(),
            server_type: "cax11".to_string(),
            location: "hel1".to_string(),
            image: "ubuntu-24.04".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_poll_interval: Duration::from_secs(3),
            ssh_timeout: Duration::from_secs(120),
            connect_retries: 3,
            connect_backoff: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            validate_credential: false,
            provision_timeout: Duration::from_secs(600),
        }
    }
}

/// Local port-forward settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// OpenSSH client binary
    pub ssh_binary: String,

    /// Remote login for forwards
    pub remote_user: String,

    /// First candidate local port
    pub base_port: u16,

    /// Number of candidate ports starting at `base_port`
    pub port_span: u16,

    /// How long a fresh forward has to start listening
    #[serde(with = "duration_secs")]
    pub settle_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            remote_user: "root".to_string(),
            base_port: 7681,
            port_span: 100,
            settle_timeout: Duration::from_secs(5),
        }
    }
}

/// Remote onboarding terminal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnboardingConfig {
    /// Base of the per-instance remote terminal port range
    pub terminal_base_port: u16,
    pub terminal_port_span: u16,

    /// Gateway port forwarded 1:1 next to the terminal
    pub gateway_port: u16,

    /// How long the local terminal endpoint has to answer HTTP
    #[serde(with = "duration_secs")]
    pub ready_timeout: Duration,

    /// Interval between readiness requests
    #[serde(with = "duration_secs")]
    pub ready_poll_interval: Duration,

    /// Bound on each readiness request
    #[serde(with = "duration_secs")]
    pub ready_request_timeout: Duration,

    /// Bound on the SSH handshake for one-shot commands
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Pause after launching the remote terminal before checking it
    #[serde(with = "duration_secs")]
    pub startup_delay: Duration,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            terminal_base_port: 7681,
            terminal_port_span: 100,
            gateway_port: 18789,
            ready_timeout: Duration::from_secs(30),
            ready_poll_interval: Duration::from_millis(500),
            ready_request_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            startup_delay: Duration::from_secs(5),
        }
    }
}

/// Agent service control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Bound on one provisioning script invocation
    #[serde(with = "duration_secs")]
    pub script_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_against_project_root() {
        let config = DashboardConfig {
            project_root: PathBuf::from("/srv/roboclaw"),
            logs_dir: PathBuf::from("/var/log/roboclaw"),
            ..Default::default()
        };
        assert_eq!(
            config.instances_path(),
            PathBuf::from("/srv/roboclaw/instances")
        );
        assert_eq!(config.logs_path(), PathBuf::from("/var/log/roboclaw"));
        assert_eq!(
            config.script_path(),
            PathBuf::from("/srv/roboclaw/run-hetzner.sh")
        );
    }

    #[test]
    fn test_defaults() {
        let config = DashboardConfig::default();
        assert_eq!(config.deploy.connect_retries, 3);
        assert_eq!(config.deploy.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.onboarding.gateway_port, 18789);
        assert_eq!(config.tunnel.port_span, 100);
    }
}
