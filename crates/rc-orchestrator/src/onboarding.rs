//! Remote onboarding terminal
//!
//! Onboarding runs the agent's interactive setup inside a `ttyd` web terminal
//! on the instance. The terminal only listens on the instance's loopback
//! interface; the dashboard reaches it through a tunnel. Each instance gets
//! its own remote port derived from its name so several instances can be
//! onboarded at once.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use rc_core::artifact::{InstanceRecord, InstanceStore};
use rc_core::config::OnboardingConfig;
use rc_core::time::iso_timestamp;
use rc_core::{ArtifactError, InstanceName, TunnelKey};
use rc_protocol::LogLevel;

use crate::artifact;
use crate::remote::{exec_capture, run_once, RemoteError, RemoteShell, ShellConnector};
use crate::tunnel::{TunnelError, TunnelManager};

/// Purpose suffix of the gateway tunnel key
pub const GATEWAY_PURPOSE: &str = "gateway";

/// Present once the agent's interactive setup has finished
const CONFIG_CHECK: &str =
    r#"test -f /home/roboclaw/.roboclaw/roboclaw.json && echo "exists" || echo "missing""#;

/// Onboarding errors
#[derive(Error, Debug)]
pub enum OnboardingError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The remote terminal did not stay up; carries its log
    #[error("ttyd failed to start. Log:\n{0}")]
    TerminalFailed(String),

    /// The tunnelled terminal never answered HTTP
    #[error("Timeout: ttyd not ready on 127.0.0.1:{port} after {elapsed_ms}ms")]
    NotReady { port: u16, elapsed_ms: u128 },
}

/// 32-bit string hash: `h = h * 31 + code_unit` over UTF-16, then `|h|`
pub fn name_hash(name: &str) -> u32 {
    name.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
        .unsigned_abs()
}

/// Remote terminal port for `name`
pub fn terminal_port(name: &str, base: u16, span: u16) -> u16 {
    let offset = name_hash(name) % u32::from(span.max(1));
    base.saturating_add(offset as u16)
}

/// Reply to a successful setup request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupInfo {
    pub url: String,
    pub tunnel_active: bool,
    pub port: u16,
    pub gateway_port: u16,
    pub gateway_active: bool,
}

/// State of an instance's onboarding tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub tunnel_active: bool,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub gateway_active: bool,
    pub gateway_port: Option<u16>,
}

/// Brings onboarding terminals up and down
#[derive(Clone)]
pub struct Onboarding {
    store: InstanceStore,
    connector: Arc<dyn ShellConnector>,
    tunnels: TunnelManager,
    http: reqwest::Client,
    config: OnboardingConfig,
}

impl Onboarding {
    pub fn new(
        store: InstanceStore,
        connector: Arc<dyn ShellConnector>,
        tunnels: TunnelManager,
        config: OnboardingConfig,
    ) -> Self {
        // Readiness requests only ever target the local end of a tunnel
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self {
            store,
            connector,
            tunnels,
            http,
            config,
        }
    }

    /// Start the remote terminal, tunnel it, and wait until it answers
    pub async fn start(&self, name: &InstanceName) -> Result<SetupInfo, OnboardingError> {
        let (record, private_key) = artifact::load_with_key(&self.store, name).await?;
        let remote_port = terminal_port(
            name.as_str(),
            self.config.terminal_base_port,
            self.config.terminal_port_span,
        );
        tracing::info!(
            "Starting onboarding for {} at {} (remote port {})",
            name,
            record.ip,
            remote_port
        );

        self.start_terminal(&record, &private_key, remote_port)
            .await?;

        let port = self
            .tunnels
            .start_tunnel(
                &TunnelKey::primary(name.clone()),
                &record.ip,
                &record.key_path,
                remote_port,
            )
            .await?;
        tracing::info!("Onboarding tunnel for {} on local port {}", name, port);

        let gateway_port = self.config.gateway_port;
        let gateway_active = match self
            .tunnels
            .start_fixed_port_tunnel(
                &gateway_key(name),
                &record.ip,
                &record.key_path,
                gateway_port,
                gateway_port,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    "Could not create gateway tunnel for {} on port {}: {}",
                    name,
                    gateway_port,
                    e
                );
                false
            }
        };

        self.wait_until_ready(port).await?;

        Ok(SetupInfo {
            url: format!("http://localhost:{}", port),
            tunnel_active: true,
            port,
            gateway_port,
            gateway_active,
        })
    }

    /// Stop both onboarding tunnels of `name`
    pub fn stop(&self, name: &InstanceName) -> bool {
        let primary = self.tunnels.stop_tunnel(&TunnelKey::primary(name.clone()));
        let gateway = self.tunnels.stop_tunnel(&gateway_key(name));
        primary || gateway
    }

    /// Record onboarding as finished if the agent wrote its config
    ///
    /// The onboarding tunnel is stopped either way.
    pub async fn complete(&self, name: &InstanceName) -> Result<bool, OnboardingError> {
        let (record, private_key) = artifact::load_with_key(&self.store, name).await?;

        let output = run_once(self.connector.as_ref(), &record.ip, &private_key, CONFIG_CHECK)
            .await?;
        let completed = output.stdout_text().trim() == "exists";

        if completed {
            artifact::mark_onboarding_completed(&self.store, name, iso_timestamp()).await?;
        } else {
            tracing::info!("Onboarding of {} has not finished yet", name);
        }

        self.tunnels.stop_tunnel(&TunnelKey::primary(name.clone()));
        Ok(completed)
    }

    /// Current tunnel state of `name`
    pub fn status(&self, name: &InstanceName) -> TunnelStatus {
        let primary = TunnelKey::primary(name.clone());
        let gateway = gateway_key(name);
        let port = self.tunnels.get_port(&primary);

        TunnelStatus {
            tunnel_active: self.tunnels.is_active(&primary),
            url: port.map(|p| format!("http://localhost:{}", p)),
            port,
            gateway_active: self.tunnels.is_active(&gateway),
            gateway_port: self.tunnels.get_port(&gateway),
        }
    }

    async fn start_terminal(
        &self,
        record: &InstanceRecord,
        private_key: &str,
        remote_port: u16,
    ) -> Result<(), OnboardingError> {
        let name = record.name.as_str();
        let on_log = |level: LogLevel, line: &str| {
            tracing::debug!("[onboard {}] {}: {}", name, level.as_str(), line);
        };

        let mut shell = self.connector.shell();
        let result = match shell.connect(&record.ip, private_key, &on_log, 1).await {
            Ok(()) => self.launch_ttyd(shell.as_mut(), name, remote_port).await,
            Err(e) => Err(e.into()),
        };
        shell.disconnect().await;
        result
    }

    async fn launch_ttyd(
        &self,
        shell: &mut dyn RemoteShell,
        name: &str,
        remote_port: u16,
    ) -> Result<(), OnboardingError> {
        let script_path = format!("/usr/local/bin/roboclaw-onboard-{}.sh", name);
        let log_path = format!("/tmp/ttyd-{}.log", name);

        let wrapper = format!(
            r#"cat > {} << 'EOF'
#!/bin/bash
su -l roboclaw -c "export PATH=/home/roboclaw/.local/bin:\$PATH && openclaw onboard"
EOF"#,
            script_path
        );
        checked(shell, &wrapper).await?;
        checked(shell, &format!("chmod +x {}", script_path)).await?;

        exec_capture(
            shell,
            &format!(r#"pkill -f "ttyd.*--port {}" || true"#, remote_port),
        )
        .await?;

        tracing::debug!("Starting ttyd on port {} for {}", remote_port, name);
        exec_capture(
            shell,
            &format!(
                "nohup ttyd --writable --port {} --interface 127.0.0.1 {} > {} 2>&1 &",
                remote_port, script_path, log_path
            ),
        )
        .await?;

        tokio::time::sleep(self.config.startup_delay).await;

        let running = exec_capture(shell, &format!(r#"pgrep -f "ttyd.*--port {}""#, remote_port))
            .await?;
        if running.success() && !running.stdout_text().trim().is_empty() {
            tracing::info!(
                "ttyd is running for {} (pid {})",
                name,
                running.stdout_text().trim()
            );
            return Ok(());
        }

        let log = exec_capture(shell, &format!("cat {}", log_path)).await?;
        Err(OnboardingError::TerminalFailed(log.stdout_text()))
    }

    /// Poll the local end of the tunnel until the terminal serves a page
    async fn wait_until_ready(&self, port: u16) -> Result<(), OnboardingError> {
        let url = format!("http://127.0.0.1:{}/", port);
        let started = Instant::now();
        let deadline = started + self.config.ready_timeout;
        let mut attempts: u32 = 0;

        while Instant::now() < deadline {
            attempts += 1;
            let request = self
                .http
                .get(&url)
                .timeout(self.config.ready_request_timeout)
                .send()
                .await;

            match request {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        "ttyd ready on port {} after {} attempts ({}ms)",
                        port,
                        attempts,
                        started.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Ok(response) => tracing::trace!("ttyd answered {}", response.status()),
                Err(e) if attempts % 10 == 0 => {
                    tracing::debug!("Waiting for ttyd on port {} (attempt {}): {}", port, attempts, e)
                }
                Err(_) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.ready_poll_interval.min(remaining)).await;
        }

        Err(OnboardingError::NotReady {
            port,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }
}

fn gateway_key(name: &InstanceName) -> TunnelKey {
    TunnelKey::with_purpose(name.clone(), GATEWAY_PURPOSE)
}

/// Run `command`, failing on a non-zero exit
async fn checked(shell: &mut dyn RemoteShell, command: &str) -> Result<(), RemoteError> {
    let output = exec_capture(shell, command).await?;
    if output.success() {
        Ok(())
    } else {
        Err(RemoteError::CommandFailed {
            command: command.lines().next().unwrap_or(command).to_string(),
            code: output.code,
        })
    }
}
