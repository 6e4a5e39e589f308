//! Agent gateway service control
//!
//! The gateway runs as a systemd user unit of the `roboclaw` account. Its
//! state is read over SSH; changing it goes through the provisioning script so
//! the script's inventory stays the source of truth.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use rc_core::artifact::InstanceStore;
use rc_core::config::DashboardConfig;
use rc_core::{ArtifactError, InstanceName};

use crate::artifact;
use crate::remote::{run_once, RemoteError, ShellConnector};

const UNIT: &str = "openclaw-gateway";

/// Service control errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The provisioning script failed, timed out, or could not run
    #[error("Service script failed: {0:#}")]
    Script(#[from] anyhow::Error),
}

/// Requested change to the gateway service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
}

impl ServiceAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(ServiceAction::Start),
            "stop" => Some(ServiceAction::Stop),
            _ => None,
        }
    }

    /// Desired state argument for the provisioning script
    pub fn desired_state(self) -> &'static str {
        match self {
            ServiceAction::Start => "started",
            ServiceAction::Stop => "stopped",
        }
    }
}

/// Observed gateway state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// `active`, `inactive`, `failed` or `unknown`
    pub status: String,
    pub enabled: bool,
}

impl ServiceStatus {
    /// Parse the two-line output of the status probe
    pub fn parse(output: &str) -> Self {
        let mut lines = output.lines().map(str::trim);
        let status = lines
            .next()
            .filter(|line| !line.is_empty())
            .unwrap_or("unknown")
            .to_string();
        let enabled = lines.next() == Some("enabled");
        Self { status, enabled }
    }
}

/// Probe command run as the service account
fn status_command() -> String {
    format!(
        "sudo -u roboclaw bash -c \"export XDG_RUNTIME_DIR=/run/user/$(id -u roboclaw); \
         systemctl --user is-active {unit} 2>/dev/null || echo unknown; \
         systemctl --user is-enabled {unit} 2>/dev/null || echo unknown\"",
        unit = UNIT
    )
}

/// Reads and changes the gateway service of an instance
#[derive(Clone)]
pub struct ServiceControl {
    store: InstanceStore,
    connector: Arc<dyn ShellConnector>,
    script: PathBuf,
    project_root: PathBuf,
    timeout: Duration,
}

impl ServiceControl {
    pub fn new(
        store: InstanceStore,
        connector: Arc<dyn ShellConnector>,
        config: &DashboardConfig,
    ) -> Self {
        Self {
            store,
            connector,
            script: config.script_path(),
            project_root: config.project_root.clone(),
            timeout: config.service.script_timeout,
        }
    }

    /// Probe the service over SSH
    pub async fn status(&self, name: &InstanceName) -> Result<ServiceStatus, ServiceError> {
        let (record, private_key) = artifact::load_with_key(&self.store, name).await?;
        let output = run_once(
            self.connector.as_ref(),
            &record.ip,
            &private_key,
            &status_command(),
        )
        .await?;
        Ok(ServiceStatus::parse(&output.stdout_text()))
    }

    /// Apply `action` through the provisioning script, then report the real state
    pub async fn apply(
        &self,
        name: &InstanceName,
        action: ServiceAction,
    ) -> Result<ServiceStatus, ServiceError> {
        // Fail on a missing artifact before running anything
        artifact::load(&self.store, name).await?;

        let output = self.run_script(name, action).await?;
        tracing::info!(
            "Service {} on {}: {}",
            action.desired_state(),
            name,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        self.status(name).await
    }

    /// `<script> service <name> <state>`, bounded by the configured timeout
    async fn run_script(
        &self,
        name: &InstanceName,
        action: ServiceAction,
    ) -> anyhow::Result<Output> {
        let program = self.script.display().to_string();
        let mut child = Command::new(&self.script)
            .args(["service", name.as_str(), action.desired_state()])
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        let output = tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                anyhow::Ok(Output {
                    status: status.with_context(|| format!("waiting for {}", program))?,
                    stdout,
                    stderr,
                })
            } => Some(result?),
            () = tokio::time::sleep(self.timeout) => None,
        };

        let Some(output) = output else {
            let _ = child.kill().await;
            anyhow::bail!("{} timed out after {}s", program, self.timeout.as_secs());
        };

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}
