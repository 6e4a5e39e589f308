//! Port-forward processes
//!
//! A forward is a long-running `ssh -N -L` child. The manager only needs to
//! start one, learn when it exits, and stop it; [`ForwardSpawner`] is the seam
//! tests replace.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use rc_core::config::TunnelConfig;

use super::TunnelError;

/// How long a forward gets to exit after SIGTERM before it is killed
#[cfg_attr(not(unix), allow(dead_code))]
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to start one forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Logical tunnel key, for logging
    pub key: String,
    pub host: String,
    pub key_path: PathBuf,
    pub local_port: u16,
    pub remote_port: u16,
    pub user: String,
}

/// A running forward
#[async_trait]
pub trait ForwardProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit on its own; returns its exit code
    async fn wait(&mut self) -> Option<i32>;

    /// Stop the process and wait for it to go away
    async fn terminate(&mut self);
}

/// Starts forwards
#[async_trait]
pub trait ForwardSpawner: Send + Sync {
    async fn spawn(&self, spec: &ForwardSpec) -> Result<Box<dyn ForwardProcess>, TunnelError>;
}

/// Spawns the OpenSSH client
#[derive(Debug, Clone)]
pub struct SshForwarder {
    ssh_binary: String,
}

impl SshForwarder {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            ssh_binary: config.ssh_binary.clone(),
        }
    }

    /// Arguments for `ssh`
    pub fn args(spec: &ForwardSpec) -> Vec<String> {
        vec![
            "-i".to_string(),
            spec.key_path.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-L".to_string(),
            format!("{}:localhost:{}", spec.local_port, spec.remote_port),
            "-N".to_string(),
            format!("{}@{}", spec.user, spec.host),
        ]
    }
}

#[async_trait]
impl ForwardSpawner for SshForwarder {
    async fn spawn(&self, spec: &ForwardSpec) -> Result<Box<dyn ForwardProcess>, TunnelError> {
        let mut child = Command::new(&self.ssh_binary)
            .args(Self::args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Spawn(format!("{}: {}", self.ssh_binary, e)))?;

        tracing::debug!(
            "Spawned forward {} (pid {:?}): localhost:{} -> {}:{}",
            spec.key,
            child.id(),
            spec.local_port,
            spec.host,
            spec.remote_port
        );

        if let Some(stderr) = child.stderr.take() {
            let key = spec.key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!("[tunnel {}] {}", key, line);
                    }
                }
            });
        }

        Ok(Box::new(SshForwardProcess { child }))
    }
}

struct SshForwardProcess {
    child: Child,
}

#[async_trait]
impl ForwardProcess for SshForwardProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!("Failed to wait on forward: {}", e);
                None
            }
        }
    }

    async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: kill with a valid signal on a pid we own
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                if tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
                    .await
                    .is_ok()
                {
                    return;
                }
                tracing::debug!("Forward {} ignored SIGTERM, killing", pid);
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::debug!("Failed to kill forward: {}", e);
        }
    }
}
