//! Direct deployment over the cloud API and SSH

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use rc_core::config::{CloudConfig, DashboardConfig, DeployDefaults};
use rc_core::time::{generated_server_name, iso_timestamp};
use rc_core::InstanceName;
use rc_protocol::{DeployFailure, DeployResult, LogLevel, Phase};

use crate::cloud::{CloudApi, ServerSpec};
use crate::keygen::{generate_keypair, GeneratedKeyPair};
use crate::remote::{wait_for_port, RemoteShell, ShellConnector};

use super::commands;
use super::emitter::EventSink;
use super::error::DeployError;
use super::pipeline::{run_phases, PhaseDescriptor, PhaseFailure, PhaseFuture};

/// How a deployment is carried out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Cloud API plus SSH, driven by this process
    #[default]
    #[serde(alias = "ssh")]
    Direct,
    /// The external provisioning script
    Script,
}

/// Body of a deployment request
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub mode: DeployMode,
}

impl std::fmt::Debug for DeployRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployRequest")
            .field("token", &"<redacted>")
            .field("server_name", &self.server_name)
            .field("server_type", &self.server_type)
            .field("location", &self.location)
            .field("image", &self.image)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Validated deployment target with defaults applied
#[derive(Clone)]
pub struct DeployTarget {
    pub server_name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    pub mode: DeployMode,
    token: String,
}

impl DeployTarget {
    /// Validate `request` and fill in what it leaves out
    pub fn resolve(request: DeployRequest, defaults: &DeployDefaults) -> Result<Self, DeployError> {
        let token = request.token.trim().to_string();
        if token.is_empty() {
            return Err(DeployError::InvalidInput(
                "Invalid or missing Hetzner API token".to_string(),
            ));
        }

        let server_name = match non_blank(request.server_name) {
            Some(name) => InstanceName::new(name)
                .map_err(|e| DeployError::InvalidInput(e.to_string()))?
                .to_string(),
            None => generated_server_name(&defaults.name_prefix),
        };

        Ok(Self {
            server_name,
            server_type: non_blank(request.server_type)
                .unwrap_or_else(|| defaults.server_type.clone()),
            location: non_blank(request.location).unwrap_or_else(|| defaults.location.clone()),
            image: non_blank(request.image).unwrap_or_else(|| defaults.image.clone()),
            mode: request.mode,
            token,
        })
    }

    /// The caller's API token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Name the public key is registered under
    pub fn key_name(&self) -> String {
        format!("{}-key", self.server_name)
    }
}

impl std::fmt::Debug for DeployTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployTarget")
            .field("server_name", &self.server_name)
            .field("server_type", &self.server_type)
            .field("location", &self.location)
            .field("image", &self.image)
            .field("mode", &self.mode)
            .field("token", &"<redacted>")
            .finish()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Everything one run has learned so far
#[derive(Debug)]
pub struct DeploymentState {
    pub target: DeployTarget,
    pub keypair: Option<GeneratedKeyPair>,
    pub ssh_key_id: Option<u64>,
    pub server_id: Option<u64>,
    pub server_ip: Option<String>,
    pub connected: bool,
    pub result: Option<DeployResult>,
    started: Instant,
}

impl DeploymentState {
    pub fn new(target: DeployTarget) -> Self {
        Self {
            target,
            keypair: None,
            ssh_key_id: None,
            server_id: None,
            server_ip: None,
            connected: false,
            result: None,
            started: Instant::now(),
        }
    }

    fn ip(&self) -> Result<&str, DeployError> {
        self.server_ip
            .as_deref()
            .ok_or(DeployError::MissingState("server IP"))
    }

    fn keypair(&self) -> Result<&GeneratedKeyPair, DeployError> {
        self.keypair
            .as_ref()
            .ok_or(DeployError::MissingState("SSH key pair"))
    }
}

/// Shared by every phase of one run
pub struct PhaseContext {
    cloud: Arc<dyn CloudApi>,
    cloud_config: CloudConfig,
    deploy: DeployDefaults,
    sink: EventSink,
    shell: Mutex<Box<dyn RemoteShell>>,
}

impl PhaseContext {
    fn log(&self, level: LogLevel, message: &str) {
        self.sink.log(level, message);
    }
}

type Descriptor = PhaseDescriptor<PhaseContext, DeploymentState>;

/// The fixed provisioning pipeline
const PIPELINE: [Descriptor; 12] = [
    Descriptor { phase: Phase::Keygen, progress: 5, run: keygen },
    Descriptor { phase: Phase::SshKey, progress: 10, run: upload_key },
    Descriptor { phase: Phase::Provisioning, progress: 25, run: create_server },
    Descriptor { phase: Phase::SshWait, progress: 30, run: wait_for_ssh },
    Descriptor { phase: Phase::InstallPackages, progress: 40, run: remote_phase },
    Descriptor { phase: Phase::CreateUser, progress: 50, run: remote_phase },
    Descriptor { phase: Phase::InstallDocker, progress: 60, run: remote_phase },
    Descriptor { phase: Phase::ConfigureFirewall, progress: 70, run: remote_phase },
    Descriptor { phase: Phase::InstallRuntime, progress: 80, run: remote_phase },
    Descriptor { phase: Phase::InstallApplication, progress: 90, run: remote_phase },
    Descriptor { phase: Phase::Verify, progress: 95, run: remote_phase },
    Descriptor { phase: Phase::Success, progress: 100, run: finish },
];

fn keygen<'a>(
    ctx: &'a PhaseContext,
    state: &'a mut DeploymentState,
    _phase: Phase,
) -> PhaseFuture<'a> {
    Box::pin(async move {
        ctx.log(LogLevel::Info, "Generating Ed25519 SSH keypair...");
        state.keypair = Some(generate_keypair()?);
        ctx.log(LogLevel::Success, "SSH keypair generated");
        Ok(())
    })
}

fn upload_key<'a>(
    ctx: &'a PhaseContext,
    state: &'a mut DeploymentState,
    _phase: Phase,
) -> PhaseFuture<'a> {
    Box::pin(async move {
        ctx.log(LogLevel::Info, "Creating SSH key in Hetzner Cloud...");
        let public_key = state.keypair()?.public_key.clone();
        let key = ctx
            .cloud
            .create_ssh_key(state.target.token(), &state.target.key_name(), &public_key)
            .await?;
        state.ssh_key_id = Some(key.id);
        ctx.log(LogLevel::Success, &format!("SSH key created (ID: {})", key.id));
        Ok(())
    })
}

fn create_server<'a>(
    ctx: &'a PhaseContext,
    state: &'a mut DeploymentState,
    _phase: Phase,
) -> PhaseFuture<'a> {
    Box::pin(async move {
        let target = &state.target;
        ctx.log(
            LogLevel::Info,
            &format!(
                "Creating {} server in {}...",
                target.server_type, target.location
            ),
        );

        let ssh_key_id = state
            .ssh_key_id
            .ok_or(DeployError::MissingState("SSH key id"))?;
        let spec = ServerSpec {
            name: target.server_name.clone(),
            server_type: target.server_type.clone(),
            image: target.image.clone(),
            location: target.location.clone(),
            ssh_keys: vec![ssh_key_id],
        };
        let server = ctx.cloud.create_server(target.token(), &spec).await?;
        state.server_id = Some(server.id);
        state.server_ip = server.ip().map(str::to_string);
        ctx.log(
            LogLevel::Success,
            &format!(
                "Server created (ID: {}, IP: {})",
                server.id,
                state.server_ip.as_deref().unwrap_or("pending")
            ),
        );

        ctx.log(LogLevel::Info, "Waiting for server to start...");
        let on_progress = |status: &str| ctx.log(LogLevel::Info, status);
        ctx.cloud
            .wait_for_server_running(
                state.target.token(),
                server.id,
                &on_progress,
                ctx.cloud_config.server_timeout,
            )
            .await?;

        if state.server_ip.is_none() {
            let running = ctx.cloud.get_server(state.target.token(), server.id).await?;
            let ip = running.ip().ok_or(DeployError::NoAddress(server.id))?;
            state.server_ip = Some(ip.to_string());
        }
        ctx.log(LogLevel::Success, "Server is running");
        Ok(())
    })
}

fn wait_for_ssh<'a>(
    ctx: &'a PhaseContext,
    state: &'a mut DeploymentState,
    _phase: Phase,
) -> PhaseFuture<'a> {
    Box::pin(async move {
        ctx.log(LogLevel::Info, "Waiting for SSH to become available...");
        let on_log = |level: LogLevel, line: &str| ctx.log(level, line);
        wait_for_port(
            state.ip()?,
            ctx.deploy.ssh_port,
            ctx.deploy.ssh_poll_interval,
            ctx.deploy.ssh_timeout,
            &on_log,
        )
        .await?;
        ctx.log(LogLevel::Success, "SSH is ready");
        Ok(())
    })
}

fn remote_phase<'a>(
    ctx: &'a PhaseContext,
    state: &'a mut DeploymentState,
    phase: Phase,
) -> PhaseFuture<'a> {
    Box::pin(async move {
        let (script, starting, done) =
            commands::group(phase).ok_or(DeployError::MissingState("command group"))?;
        let on_log = |level: LogLevel, line: &str| ctx.log(level, line);
        let mut shell = ctx.shell.lock().await;

        if !state.connected {
            ctx.log(LogLevel::Info, "Connecting via SSH...");
            let ip = state.ip()?;
            let private_key = &state.keypair()?.private_key;
            shell
                .connect(ip, private_key, &on_log, ctx.deploy.connect_retries)
                .await?;
            state.connected = true;
            ctx.log(LogLevel::Success, "SSH connection established");
        }

        ctx.log(LogLevel::Info, starting);
        shell.exec_script(script, &on_log).await?;
        ctx.log(LogLevel::Success, done);
        Ok(())
    })
}

fn finish<'a>(
    ctx: &'a PhaseContext,
    state: &'a mut DeploymentState,
    _phase: Phase,
) -> PhaseFuture<'a> {
    Box::pin(async move {
        let ip = state.ip()?.to_string();
        let ssh_private_key = state.keypair()?.private_key.clone();
        let user = ctx.deploy.ssh_user.clone();

        ctx.log(
            LogLevel::Success,
            &format!(
                "Deployment completed in {}s",
                state.started.elapsed().as_secs()
            ),
        );
        state.result = Some(DeployResult {
            next_steps: vec![
                format!("ssh -i roboclaw_key {}@{}", user, ip),
                "sudo su - roboclaw".to_string(),
                "openclaw onboard --install-daemon".to_string(),
            ],
            ip,
            server_name: state.target.server_name.clone(),
            ssh_private_key,
            ssh_user: user,
        });
        Ok(())
    })
}

/// Runs direct deployments
#[derive(Clone)]
pub struct Orchestrator {
    cloud: Arc<dyn CloudApi>,
    connector: Arc<dyn ShellConnector>,
    cloud_config: CloudConfig,
    deploy: DeployDefaults,
    logs_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        connector: Arc<dyn ShellConnector>,
        config: &DashboardConfig,
    ) -> Self {
        Self {
            cloud,
            connector,
            cloud_config: config.cloud.clone(),
            deploy: config.deploy.clone(),
            logs_dir: Some(config.logs_path()),
        }
    }

    /// Do not write transcripts
    pub fn without_transcripts(mut self) -> Self {
        self.logs_dir = None;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.deploy.heartbeat_interval
    }

    /// Attach a transcript for `target` to `sink`, if transcripts are enabled
    pub fn transcript_sink(&self, sink: EventSink, target: &DeployTarget) -> EventSink {
        let sink = match &self.logs_dir {
            Some(dir) => sink.with_transcript_in(dir, &target.server_name),
            None => return sink,
        };
        sink.note(&format!("=== Deployment started at {} ===", iso_timestamp()));
        sink.note(&format!("Server name: {}", target.server_name));
        sink.note(&format!("Server type: {}", target.server_type));
        sink.note(&format!("Location: {}", target.location));
        sink.note(&format!("Image: {}", target.image));
        if let Some(path) = sink.transcript_path() {
            sink.note(&format!("Log file: {}", path.display()));
        }
        sink.note("");
        sink
    }

    /// Run the full pipeline, ending the stream with exactly one terminal event
    ///
    /// On failure every resource the run created is deleted before the error
    /// event is emitted.
    pub async fn execute(
        &self,
        target: DeployTarget,
        sink: &EventSink,
    ) -> Result<DeployResult, DeployFailure> {
        tracing::info!(
            "Starting deployment of {} ({} in {})",
            target.server_name,
            target.server_type,
            target.location
        );
        let heartbeat = sink.start_heartbeat(self.deploy.heartbeat_interval);

        let mut state = DeploymentState::new(target);
        let outcome = {
            let ctx = PhaseContext {
                cloud: Arc::clone(&self.cloud),
                cloud_config: self.cloud_config.clone(),
                deploy: self.deploy.clone(),
                sink: sink.clone(),
                shell: Mutex::new(self.connector.shell()),
            };
            let outcome = run_phases(&PIPELINE, &ctx, &mut state, sink).await;
            ctx.shell.lock().await.disconnect().await;
            outcome
        };

        let outcome = outcome.and_then(|()| {
            state.result.take().ok_or(PhaseFailure {
                phase: Phase::Success,
                error: DeployError::MissingState("deployment result"),
            })
        });

        match outcome {
            Ok(result) => {
                heartbeat.stop().await;
                tracing::info!("Deployment of {} finished at {}", result.server_name, result.ip);
                sink.success(result.clone());
                Ok(result)
            }
            Err(failure) => {
                let message = failure.error.to_string();
                sink.log_in(LogLevel::Error, &message, Some(failure.phase));
                self.rollback(&state, sink).await;
                heartbeat.stop().await;

                tracing::warn!(
                    "Deployment of {} failed in phase {}: {}",
                    state.target.server_name,
                    failure.phase,
                    message
                );
                let failure = DeployFailure {
                    message,
                    phase: Some(failure.phase),
                    server_id: state.server_id,
                    recoverable: true,
                };
                sink.failure(failure.clone());
                Err(failure)
            }
        }
    }

    /// Delete whatever the failed run created; failures are only logged
    async fn rollback(&self, state: &DeploymentState, sink: &EventSink) {
        if state.server_id.is_none() && state.ssh_key_id.is_none() {
            return;
        }
        sink.log(LogLevel::Warning, "Cleaning up resources...");
        let token = state.target.token();

        if let Some(id) = state.server_id {
            match self.cloud.delete_server(token, id).await {
                Ok(()) => sink.log(LogLevel::Info, "Server deleted"),
                Err(e) => {
                    tracing::warn!("Rollback: failed to delete server {}: {}", id, e);
                    sink.log(
                        LogLevel::Warning,
                        &format!("Failed to delete server {}: {}", id, e),
                    );
                }
            }
        }

        if let Some(id) = state.ssh_key_id {
            match self.cloud.delete_ssh_key(token, id).await {
                Ok(()) => sink.log(LogLevel::Info, "SSH key deleted"),
                Err(e) => {
                    tracing::warn!("Rollback: failed to delete SSH key {}: {}", id, e);
                    sink.log(
                        LogLevel::Warning,
                        &format!("Failed to delete SSH key {}: {}", id, e),
                    );
                }
            }
        }
    }
}
