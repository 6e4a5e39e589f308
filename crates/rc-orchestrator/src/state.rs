//! Global dashboard state

use std::sync::Arc;

use rc_core::artifact::InstanceStore;
use rc_core::config::DashboardConfig;

use crate::cloud::{CloudApi, CloudError, HcloudClient};
use crate::deploy::{Orchestrator, ScriptDeployment};
use crate::onboarding::Onboarding;
use crate::remote::{ShellConnector, SshConnector, SshOptions};
use crate::service::ServiceControl;
use crate::tunnel::{ForwardSpawner, SshForwarder, TunnelManager, TunnelSettings};

/// External collaborators the dashboard is built from
pub struct Backends {
    pub cloud: Arc<dyn CloudApi>,
    /// Shells for provisioning runs
    pub deploy_shells: Arc<dyn ShellConnector>,
    /// Shells for short dashboard commands
    pub oneshot_shells: Arc<dyn ShellConnector>,
    pub forwards: Arc<dyn ForwardSpawner>,
}

impl Backends {
    /// The real cloud API, SSH, and OpenSSH forwards
    pub fn production(config: &DashboardConfig) -> Result<Self, CloudError> {
        let ssh = SshOptions::from_deploy(&config.deploy);
        Ok(Self {
            cloud: Arc::new(HcloudClient::new(&config.cloud)?),
            deploy_shells: Arc::new(SshConnector::new(ssh.clone())),
            oneshot_shells: Arc::new(SshConnector::new(
                ssh.with_handshake_timeout(config.onboarding.handshake_timeout),
            )),
            forwards: Arc::new(SshForwarder::new(&config.tunnel)),
        })
    }
}

/// Global state for the dashboard server
pub struct AppState {
    /// Configuration
    pub config: DashboardConfig,
    /// Cloud API
    pub cloud: Arc<dyn CloudApi>,
    /// Direct deployments
    pub orchestrator: Orchestrator,
    /// Script-driven deployments
    pub script: ScriptDeployment,
    /// Every port forward this process owns
    pub tunnels: TunnelManager,
    pub onboarding: Onboarding,
    pub service: ServiceControl,
}

impl AppState {
    /// Create state backed by the real cloud API and SSH
    pub fn new(config: DashboardConfig) -> Result<Self, CloudError> {
        let backends = Backends::production(&config)?;
        Ok(Self::with_backends(config, backends))
    }

    /// Create state from explicit collaborators
    pub fn with_backends(config: DashboardConfig, backends: Backends) -> Self {
        let store = InstanceStore::new(config.instances_path(), config.project_root.clone());
        let tunnels = TunnelManager::new(backends.forwards, TunnelSettings::from(&config.tunnel));

        Self {
            orchestrator: Orchestrator::new(
                Arc::clone(&backends.cloud),
                backends.deploy_shells,
                &config,
            ),
            script: ScriptDeployment::new(&config),
            onboarding: Onboarding::new(
                store.clone(),
                Arc::clone(&backends.oneshot_shells),
                tunnels.clone(),
                config.onboarding.clone(),
            ),
            service: ServiceControl::new(store, backends.oneshot_shells, &config),
            cloud: backends.cloud,
            tunnels,
            config,
        }
    }

    /// Get the tunnel manager
    pub fn tunnel_manager(&self) -> &TunnelManager {
        &self.tunnels
    }
}
