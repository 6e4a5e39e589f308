//! Script-driven deployment
//!
//! The external provisioning script owns every resource it creates, so a
//! failure here ends the stream without any rollback. Phases are inferred
//! from the script's task names and only ever move forward.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use rc_core::config::DashboardConfig;
use rc_protocol::{DeployFailure, DeployResult, LogLevel, Phase, TOTAL_STEPS};

use super::emitter::EventSink;
use super::error::DeployError;
use super::orchestrator::DeployTarget;

/// Written by the script with the new server's address
const IP_FILE: &str = "finland-instance-ip.txt";

/// Task name fragments that mark the start of each phase
const PHASE_MARKERS: &[(Phase, &[&str])] = &[
    (Phase::Keygen, &["Generate SSH keypair", "ssh-keygen"]),
    (Phase::SshKey, &["Upload SSH key", "Create or update SSH key"]),
    (Phase::Provisioning, &["Create Hetzner Cloud server", "Create server"]),
    (Phase::SshWait, &["Wait for SSH"]),
    (Phase::InstallPackages, &["Update apt cache", "Install minimal essential packages"]),
    (Phase::CreateUser, &["Create roboclaw user"]),
    (Phase::InstallDocker, &["Install Docker"]),
    (Phase::ConfigureFirewall, &["Configure UFW", "Install UFW"]),
    (Phase::InstallRuntime, &["Install Node.js", "Add NodeSource"]),
    (Phase::InstallApplication, &["Install RoboClaw", "Install pnpm"]),
    (Phase::Verify, &["Verify roboclaw installation"]),
    (Phase::Success, &["FAST INSTALL COMPLETE"]),
];

/// Phase a script output line announces, if any
pub fn detect_phase(line: &str) -> Option<Phase> {
    PHASE_MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| line.contains(m)))
        .map(|(phase, _)| *phase)
}

/// Level a script stdout line is shown at
pub fn classify(line: &str) -> LogLevel {
    if line.contains("fatal") || line.contains("FAILED") {
        LogLevel::Error
    } else if line.contains("changed") || line.contains("ok:") {
        LogLevel::Success
    } else if line.contains("TASK") {
        LogLevel::Command
    } else {
        LogLevel::Info
    }
}

/// First IPv4 address on `line`, ignoring loopback lines
pub fn extract_ip(line: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b")
            .unwrap_or_else(|_| unreachable!("static pattern"))
    });

    if line.contains("127.0.0.1") {
        return None;
    }
    pattern
        .captures(line)
        .map(|caps| caps[1].to_string())
}

/// Progress for a phase inferred from script output
fn phase_percent(phase: Phase) -> u8 {
    (u16::from(phase.step()) * 100 / u16::from(TOTAL_STEPS)) as u8
}

/// Runs `<script> provision` and reports its output
#[derive(Debug, Clone)]
pub struct ScriptDeployment {
    script: PathBuf,
    project_root: PathBuf,
    ssh_user: String,
    timeout: Duration,
    heartbeat_interval: Duration,
}

impl ScriptDeployment {
    pub fn new(config: &DashboardConfig) -> Self {
        Self {
            script: config.script_path(),
            project_root: config.project_root.clone(),
            ssh_user: config.deploy.ssh_user.clone(),
            timeout: config.deploy.provision_timeout,
            heartbeat_interval: config.deploy.heartbeat_interval,
        }
    }

    /// Run the script to completion, ending the stream with one terminal event
    pub async fn execute(
        &self,
        target: &DeployTarget,
        sink: &EventSink,
    ) -> Result<DeployResult, DeployFailure> {
        let heartbeat = sink.start_heartbeat(self.heartbeat_interval);
        sink.log_in(LogLevel::Info, "Starting provisioning script...", Some(Phase::Keygen));
        sink.phase(Phase::Keygen);

        let outcome = self.run(target, sink).await;
        heartbeat.stop().await;

        match outcome {
            Ok(result) => {
                sink.success(result.clone());
                Ok(result)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Script deployment of {} failed: {}", target.server_name, message);
                let failure = DeployFailure {
                    message,
                    phase: sink.current_phase(),
                    server_id: None,
                    recoverable: false,
                };
                sink.failure(failure.clone());
                Err(failure)
            }
        }
    }

    async fn run(&self, target: &DeployTarget, sink: &EventSink) -> Result<DeployResult, DeployError> {
        let started = Instant::now();
        let mut child = Command::new(&self.script)
            .arg("provision")
            .current_dir(&self.project_root)
            .env("HCLOUD_TOKEN", target.token())
            .env("SERVER_NAME", &target.server_name)
            .env("SERVER_TYPE", &target.server_type)
            .env("LOCATION", &target.location)
            .env("IMAGE", &target.image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DeployError::Script(format!("Failed to execute provisioning script: {}", e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeployError::Script("script stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeployError::Script("script stderr unavailable".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut server_ip: Option<String> = None;

        let streamed = async {
            let (mut out_open, mut err_open) = (true, true);
            while out_open || err_open {
                tokio::select! {
                    line = stdout.next_line(), if out_open => match line {
                        Ok(Some(line)) => on_stdout(&line, &mut server_ip, sink),
                        _ => out_open = false,
                    },
                    line = stderr.next_line(), if err_open => match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                sink.log(LogLevel::Warning, &line);
                            }
                        }
                        _ => err_open = false,
                    },
                }
            }
            child.wait().await
        };

        let status = match tokio::time::timeout(self.timeout, streamed).await {
            Ok(status) => status.map_err(|e| {
                DeployError::Script(format!("Failed to wait for provisioning script: {}", e))
            })?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill provisioning script: {}", e);
                }
                return Err(DeployError::Script(format!(
                    "Provisioning script timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let duration = started.elapsed().as_secs();
        sink.note(&format!(
            "=== Process exited with code {} after {}s ===",
            status.code().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
            duration
        ));
        if !status.success() {
            return Err(DeployError::Script(match status.code() {
                Some(code) => format!("Provisioning script failed with exit code {}", code),
                None => "Provisioning script was terminated by a signal".to_string(),
            }));
        }

        let ip = match tokio::fs::read_to_string(self.project_root.join(IP_FILE)).await {
            Ok(content) if !content.trim().is_empty() => Some(content.trim().to_string()),
            _ => {
                sink.note("Failed to read IP file, using IP from logs");
                server_ip
            }
        };
        let ip = ip.ok_or_else(|| {
            DeployError::Script("Failed to determine server IP address".to_string())
        })?;

        let key_path = self
            .project_root
            .join("ssh-keys")
            .join(format!("{}_key", target.server_name));
        let ssh_private_key = match tokio::fs::read_to_string(&key_path).await {
            Ok(key) => key,
            Err(e) => {
                sink.log(
                    LogLevel::Warning,
                    &format!("Could not read SSH key file {}: {}", key_path.display(), e),
                );
                String::new()
            }
        };

        sink.log(LogLevel::Success, &format!("Deployment completed in {}s", duration));
        sink.progress(100);

        Ok(DeployResult {
            next_steps: vec![
                "Complete setup from the dashboard at /instances".to_string(),
                format!("Or manually: ssh -i roboclaw_key {}@{}", self.ssh_user, ip),
                "sudo su - roboclaw".to_string(),
                "openclaw onboard".to_string(),
            ],
            ip,
            server_name: target.server_name.clone(),
            ssh_private_key,
            ssh_user: self.ssh_user.clone(),
        })
    }
}

fn on_stdout(line: &str, server_ip: &mut Option<String>, sink: &EventSink) {
    if line.trim().is_empty() {
        return;
    }
    if server_ip.is_none() {
        *server_ip = extract_ip(line);
    }
    if let Some(phase) = detect_phase(line) {
        if sink.phase(phase) {
            sink.progress(phase_percent(phase));
        }
    }
    sink.log(classify(line), line);
}
