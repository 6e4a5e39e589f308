//! Remote command execution
//!
//! A [`RemoteShell`] is one authenticated connection to a host on which
//! commands run strictly one after another. Output is streamed line by line
//! to a log callback as it arrives: stdout at `info`, stderr at `warning`.

mod probe;
mod ssh;

pub use probe::wait_for_port;
pub use ssh::{LineBuffer, SshConnector, SshOptions, SshShell};

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

use rc_protocol::LogLevel;

/// Receives remote output and progress lines
pub type LogFn<'a> = &'a (dyn Fn(LogLevel, &str) + Send + Sync);

/// Remote execution errors
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The private key could not be parsed
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Every connection attempt failed
    #[error("SSH connection to {host} failed after {attempts} attempts: {message}")]
    ConnectFailed {
        host: String,
        attempts: u32,
        message: String,
    },

    /// The host refused our key
    #[error("Authentication rejected for {user}@{host}")]
    AuthRejected { user: String, host: String },

    /// `exec` called before `connect`
    #[error("Not connected")]
    NotConnected,

    /// A script command exited non-zero
    #[error("Command failed with exit code {code}: {command}")]
    CommandFailed { command: String, code: u32 },

    /// Channel-level failure while running a command
    #[error("Channel error: {0}")]
    Channel(String),

    /// A bounded wait elapsed
    #[error("{what} did not become available within {secs}s")]
    Timeout { what: String, secs: u64 },
}

/// One authenticated remote shell
#[async_trait]
pub trait RemoteShell: Send {
    /// Connect and authenticate, making up to `retries` attempts
    async fn connect(
        &mut self,
        host: &str,
        private_key: &str,
        on_log: LogFn<'_>,
        retries: u32,
    ) -> Result<(), RemoteError>;

    /// Run one command, streaming its output, and return its exit code
    async fn exec(&mut self, command: &str, on_log: LogFn<'_>) -> Result<u32, RemoteError>;

    /// Close the connection; safe to call repeatedly or when never connected
    async fn disconnect(&mut self);

    /// Run `commands` in order, stopping at the first non-zero exit
    async fn exec_script(&mut self, commands: &[&str], on_log: LogFn<'_>) -> Result<(), RemoteError> {
        for command in commands {
            on_log(LogLevel::Command, &format!("$ {}", command));
            let code = self.exec(command, on_log).await?;
            if code != 0 {
                return Err(RemoteError::CommandFailed {
                    command: command.to_string(),
                    code,
                });
            }
        }
        Ok(())
    }
}

/// Creates fresh shells; one per deployment or one-shot request
pub trait ShellConnector: Send + Sync {
    fn shell(&self) -> Box<dyn RemoteShell>;
}

/// Collected output of a single command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: u32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout joined with newlines
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Run `command` and collect its output instead of streaming it
pub async fn exec_capture(
    shell: &mut dyn RemoteShell,
    command: &str,
) -> Result<CommandOutput, RemoteError> {
    let lines: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());
    let collect = |level: LogLevel, line: &str| {
        if let Ok(mut lines) = lines.lock() {
            lines.push((level, line.to_string()));
        }
    };

    let code = shell.exec(command, &collect).await?;

    let mut output = CommandOutput {
        code,
        ..Default::default()
    };
    for (level, line) in lines.into_inner().unwrap_or_default() {
        match level {
            LogLevel::Warning | LogLevel::Error => output.stderr.push(line),
            _ => output.stdout.push(line),
        }
    }
    Ok(output)
}

/// Connect once, run `command`, and always disconnect
pub async fn run_once(
    connector: &dyn ShellConnector,
    host: &str,
    private_key: &str,
    command: &str,
) -> Result<CommandOutput, RemoteError> {
    let on_log = |level: LogLevel, line: &str| {
        tracing::debug!("[{}] {}: {}", host, level.as_str(), line);
    };
    let mut shell = connector.shell();

    let result = match shell.connect(host, private_key, &on_log, 1).await {
        Ok(()) => exec_capture(shell.as_mut(), command).await,
        Err(e) => Err(e),
    };
    shell.disconnect().await;
    result
}
