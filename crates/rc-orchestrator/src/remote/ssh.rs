//! SSH-backed remote shell

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};

use rc_core::config::DeployDefaults;
use rc_protocol::LogLevel;

use super::{LogFn, RemoteError, RemoteShell, ShellConnector};

/// SSH extended data stream carrying stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Connection parameters shared by every shell from one connector
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub port: u16,
    pub user: String,
    /// Bound on connect plus authentication for one attempt
    pub handshake_timeout: Duration,
    /// Pause between failed attempts
    pub retry_delay: Duration,
}

impl SshOptions {
    /// Options used while provisioning a fresh server
    pub fn from_deploy(deploy: &DeployDefaults) -> Self {
        Self {
            port: deploy.ssh_port,
            user: deploy.ssh_user.clone(),
            handshake_timeout: deploy.handshake_timeout,
            retry_delay: deploy.connect_backoff,
        }
    }

    /// Same target with a different handshake bound
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Hands out [`SshShell`]s with fixed options
#[derive(Debug, Clone)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

impl ShellConnector for SshConnector {
    fn shell(&self) -> Box<dyn RemoteShell> {
        Box::new(SshShell::new(self.options.clone()))
    }
}

/// Remote shell over an SSH session
pub struct SshShell {
    options: SshOptions,
    session: Option<Handle<ClientHandler>>,
}

impl SshShell {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            session: None,
        }
    }

    /// One connect-and-authenticate attempt, bounded by the handshake timeout
    async fn try_connect(
        &self,
        host: &str,
        key: &Arc<KeyPair>,
    ) -> Result<Handle<ClientHandler>, RemoteError> {
        let attempt = async {
            let config = Arc::new(Config::default());
            let handler = ClientHandler {
                host: host.to_string(),
            };

            tracing::debug!("Connecting to {}:{}", host, self.options.port);
            let mut session = client::connect(config, (host, self.options.port), handler)
                .await
                .map_err(|e| RemoteError::Channel(format!("connect: {}", e)))?;

            tracing::debug!("Authenticating as user '{}'", self.options.user);
            let authenticated = session
                .authenticate_publickey(&self.options.user, Arc::clone(key))
                .await
                .map_err(|e| RemoteError::Channel(format!("authentication: {}", e)))?;

            if !authenticated {
                return Err(RemoteError::AuthRejected {
                    user: self.options.user.clone(),
                    host: host.to_string(),
                });
            }
            Ok(session)
        };

        tokio::time::timeout(self.options.handshake_timeout, attempt)
            .await
            .map_err(|_| {
                RemoteError::Channel(format!(
                    "handshake timed out after {}s",
                    self.options.handshake_timeout.as_secs()
                ))
            })?
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(
        &mut self,
        host: &str,
        private_key: &str,
        on_log: LogFn<'_>,
        retries: u32,
    ) -> Result<(), RemoteError> {
        self.disconnect().await;

        let key = russh_keys::decode_secret_key(private_key, None)
            .map_err(|e| RemoteError::InvalidKey(e.to_string()))?;
        let key = Arc::new(key);
        let attempts = retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.try_connect(host, &key).await {
                Ok(session) => {
                    tracing::info!("SSH connected to {}@{}", self.options.user, host);
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    let message = format!(
                        "SSH connection attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    tracing::warn!("{}", message);
                    on_log(LogLevel::Warning, &message);
                    last_error = e.to_string();

                    if attempt < attempts {
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
            }
        }

        Err(RemoteError::ConnectFailed {
            host: host.to_string(),
            attempts,
            message: last_error,
        })
    }

    async fn exec(&mut self, command: &str, on_log: LogFn<'_>) -> Result<u32, RemoteError> {
        let session = self.session.as_ref().ok_or(RemoteError::NotConnected)?;

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::Channel(format!("open session: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteError::Channel(format!("exec: {}", e)))?;

        let mut stdout = LineBuffer::new();
        let mut stderr = LineBuffer::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    for line in stdout.push(data) {
                        tracing::debug!("[remote] {}", line);
                        on_log(LogLevel::Info, &line);
                    }
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    for line in stderr.push(data) {
                        tracing::debug!("[remote:stderr] {}", line);
                        on_log(LogLevel::Warning, &line);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                }
                _ => {}
            }
        }

        if let Some(line) = stdout.finish() {
            on_log(LogLevel::Info, &line);
        }
        if let Some(line) = stderr.finish() {
            on_log(LogLevel::Warning, &line);
        }

        exit_code.ok_or_else(|| {
            RemoteError::Channel(format!("no exit status for command: {}", command))
        })
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                tracing::debug!("SSH disconnect: {}", e);
            }
        }
    }
}

/// SSH client handler
///
/// Freshly created servers have host keys nobody has seen yet, so every key
/// is accepted and its fingerprint logged.
struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.host,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

/// Splits a byte stream into lines
///
/// Blank lines are dropped and a trailing `\r` is removed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every line it completed
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            if let Some(line) = decode_line(&raw[..pos]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Return the unterminated remainder, if any
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_joins_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"Reading pack").is_empty());
        assert_eq!(
            buf.push(b"age lists...\r\nDone\n\npartial"),
            vec!["Reading package lists...", "Done"]
        );
        assert_eq!(buf.finish().as_deref(), Some("partial"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_handles_multibyte_across_chunks() {
        let mut buf = LineBuffer::new();
        let text = "✅ ok\n".as_bytes();
        assert!(buf.push(&text[..2]).is_empty());
        assert_eq!(buf.push(&text[2..]), vec!["✅ ok"]);
    }

    #[tokio::test]
    async fn test_exec_without_connect() {
        let options = SshOptions::from_deploy(&DeployDefaults::default());
        let mut shell = SshShell::new(options);
        let on_log = |_: LogLevel, _: &str| {};

        assert!(matches!(
            shell.exec("true", &on_log).await,
            Err(RemoteError::NotConnected)
        ));
        shell.disconnect().await;
        shell.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_garbage_key() {
        let options = SshOptions::from_deploy(&DeployDefaults::default());
        let mut shell = SshShell::new(options);
        let on_log = |_: LogLevel, _: &str| {};

        let result = shell.connect("127.0.0.1", "not a key", &on_log, 1).await;
        assert!(matches!(result, Err(RemoteError::InvalidKey(_))));
    }
}
