//! TCP readiness probing

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use rc_protocol::LogLevel;

use super::{LogFn, RemoteError};

/// Bound on a single connection attempt
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `host:port` until a TCP connection succeeds or `timeout` elapses
pub async fn wait_for_port(
    host: &str,
    port: u16,
    poll_interval: Duration,
    timeout: Duration,
    on_log: LogFn<'_>,
) -> Result<(), RemoteError> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = ATTEMPT_TIMEOUT.min(remaining.max(Duration::from_millis(1)));

        match tokio::time::timeout(attempt, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                tracing::debug!("{}:{} is accepting connections", host, port);
                return Ok(());
            }
            Ok(Err(e)) => tracing::trace!("{}:{} not ready: {}", host, port, e),
            Err(_) => tracing::trace!("{}:{} connect timed out", host, port),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RemoteError::Timeout {
                what: "SSH".to_string(),
                secs: timeout.as_secs(),
            });
        }
        on_log(LogLevel::Info, "SSH not ready yet, retrying...");
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_port_is_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let on_log = |_: LogLevel, _: &str| {};

        wait_for_port(
            "127.0.0.1",
            port,
            Duration::from_millis(50),
            Duration::from_secs(2),
            &on_log,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_times_out() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let on_log = |_: LogLevel, _: &str| {};

        let err = wait_for_port(
            "127.0.0.1",
            port,
            Duration::from_millis(50),
            Duration::from_millis(300),
            &on_log,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("SSH did not become available"));
    }
}
