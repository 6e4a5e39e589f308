//! Tunnel registry
//!
//! # Lifecycle
//!
//! 1. `start_tunnel` returns the existing port when the key is known
//! 2. Otherwise a local port is claimed and a record inserted for the key;
//!    a concurrent start for the same key finds that record and waits for it
//! 3. The forward is spawned and a monitor task watches it
//! 4. The port is verified: binding it must fail with "address in use"
//! 5. The record leaves the registry on `stop_tunnel`, when the forward exits
//!    on its own, or on `stop_all`
//!
//! Ports are released by the monitor only after the forward is gone, so a
//! port is never handed out while an old process may still hold it.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rc_core::config::TunnelConfig;
use rc_core::time::current_time_millis;
use rc_core::TunnelKey;

use super::forward::{ForwardSpawner, ForwardSpec};
use super::TunnelError;

/// Interval between listen checks while a forward settles
const VERIFY_POLL: Duration = Duration::from_millis(100);

/// How long `shutdown` waits for forwards to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunnel manager settings
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Remote login for forwards
    pub user: String,
    pub base_port: u16,
    pub port_span: u16,
    /// How long a fresh forward has to start listening
    pub settle_timeout: Duration,
}

impl From<&TunnelConfig> for TunnelSettings {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            user: config.remote_user.clone(),
            base_port: config.base_port,
            port_span: config.port_span,
            settle_timeout: config.settle_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Starting,
    Live,
    Failed,
}

struct TunnelRecord {
    generation: u64,
    local_port: u16,
    remote_port: u16,
    host: String,
    pid: Option<u32>,
    started_at: u64,
    cancel: CancellationToken,
    ready: watch::Receiver<Readiness>,
}

/// Snapshot of a live tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub key: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub host: String,
    pub pid: Option<u32>,
    /// Unix millis
    pub started_at: u64,
}

struct Registry {
    tunnels: DashMap<String, TunnelRecord>,
    /// Local ports held by a record or by a forward that is still exiting
    claimed: DashSet<u16>,
    next_generation: AtomicU64,
    monitors: TaskTracker,
}

impl Registry {
    /// Remove `key` only if it still belongs to `generation`
    fn remove_generation(&self, key: &str, generation: u64) -> bool {
        self.tunnels
            .remove_if(key, |_, record| record.generation == generation)
            .is_some()
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.tunnels
            .get(key)
            .map(|record| record.generation == generation)
            .unwrap_or(false)
    }
}

/// Registry of live port forwards, keyed by logical name
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Registry>,
    spawner: Arc<dyn ForwardSpawner>,
    settings: TunnelSettings,
}

impl TunnelManager {
    /// Create an empty manager
    pub fn new(spawner: Arc<dyn ForwardSpawner>, settings: TunnelSettings) -> Self {
        Self {
            inner: Arc::new(Registry {
                tunnels: DashMap::new(),
                claimed: DashSet::new(),
                next_generation: AtomicU64::new(1),
                monitors: TaskTracker::new(),
            }),
            spawner,
            settings,
        }
    }

    /// Forward a free local port to `remote_port` on `host`
    ///
    /// Returns the existing port without spawning when `key` is already live.
    pub async fn start_tunnel(
        &self,
        key: &TunnelKey,
        host: &str,
        key_path: &Path,
        remote_port: u16,
    ) -> Result<u16, TunnelError> {
        let name = key.to_string();
        if let Some(port) = self.existing(&name).await? {
            tracing::debug!("Tunnel {} already on port {}", name, port);
            return Ok(port);
        }

        let local_port = self.claim_free_port()?;
        self.launch(name, host, key_path, local_port, remote_port)
            .await
    }

    /// Forward a caller-chosen local port; fails if anything occupies it
    pub async fn start_fixed_port_tunnel(
        &self,
        key: &TunnelKey,
        host: &str,
        key_path: &Path,
        local_port: u16,
        remote_port: u16,
    ) -> Result<u16, TunnelError> {
        let name = key.to_string();
        if let Some(port) = self.existing(&name).await? {
            return Ok(port);
        }

        self.claim_fixed_port(local_port).await?;
        self.launch(name, host, key_path, local_port, remote_port)
            .await
    }

    /// Stop a tunnel; unknown keys are ignored
    pub fn stop_tunnel(&self, key: &TunnelKey) -> bool {
        self.stop_named(&key.to_string())
    }

    fn stop_named(&self, name: &str) -> bool {
        match self.inner.tunnels.remove(name) {
            Some((_, record)) => {
                record.cancel.cancel();
                tracing::info!("Stopped tunnel {} (port {})", name, record.local_port);
                true
            }
            None => false,
        }
    }

    /// Whether `key` has a verified, running forward
    pub fn is_active(&self, key: &TunnelKey) -> bool {
        self.inner
            .tunnels
            .get(&key.to_string())
            .map(|record| *record.ready.borrow() == Readiness::Live)
            .unwrap_or(false)
    }

    /// Local port of `key`
    pub fn get_port(&self, key: &TunnelKey) -> Option<u16> {
        self.inner
            .tunnels
            .get(&key.to_string())
            .map(|record| record.local_port)
    }

    /// Keys of every tracked tunnel, sorted
    pub fn get_active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .tunnels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of `key`
    pub fn info(&self, key: &TunnelKey) -> Option<TunnelInfo> {
        let name = key.to_string();
        self.inner
            .tunnels
            .get(&name)
            .map(|record| snapshot(&name, &record))
    }

    /// Snapshots of every tracked tunnel, sorted by key
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut list: Vec<TunnelInfo> = self
            .inner
            .tunnels
            .iter()
            .map(|entry| snapshot(entry.key(), entry.value()))
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub fn len(&self) -> usize {
        self.inner.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tunnels.is_empty()
    }

    /// Stop every tunnel; returns how many were stopped
    pub fn stop_all(&self) -> usize {
        let keys = self.get_active_keys();
        keys.iter().filter(|name| self.stop_named(name)).count()
    }

    /// Stop every tunnel and wait for the forwards to exit
    pub async fn shutdown(&self) {
        let stopped = self.stop_all();
        tracing::info!("Shutting down {} tunnel(s)", stopped);

        self.inner.monitors.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.inner.monitors.wait())
            .await
            .is_err()
        {
            tracing::warn!("Some tunnel processes did not exit in time");
        }
    }

    /// Port of an existing record for `name`, once it has settled
    async fn existing(&self, name: &str) -> Result<Option<u16>, TunnelError> {
        let found = self
            .inner
            .tunnels
            .get(name)
            .map(|record| (record.local_port, record.ready.clone()));

        match found {
            Some((port, ready)) => {
                wait_ready(name, port, ready).await?;
                Ok(Some(port))
            }
            None => Ok(None),
        }
    }

    fn claim_free_port(&self) -> Result<u16, TunnelError> {
        let start = self.settings.base_port;
        let end = start.saturating_add(self.settings.port_span.saturating_sub(1));

        for port in start..=end {
            if !self.inner.claimed.insert(port) {
                continue;
            }
            if port_is_free(port) {
                return Ok(port);
            }
            self.inner.claimed.remove(&port);
        }

        Err(TunnelError::NoFreePort { start, end })
    }

    async fn claim_fixed_port(&self, port: u16) -> Result<(), TunnelError> {
        let deadline = Instant::now() + self.settings.settle_timeout;

        loop {
            if self.inner.claimed.insert(port) {
                if port_is_free(port) {
                    return Ok(());
                }
                self.inner.claimed.remove(&port);
                return Err(TunnelError::PortInUse(port));
            }

            let held_by_live = self
                .inner
                .tunnels
                .iter()
                .any(|entry| entry.local_port == port);
            if held_by_live || Instant::now() >= deadline {
                return Err(TunnelError::PortInUse(port));
            }

            // An old forward on this port is still exiting
            tokio::time::sleep(VERIFY_POLL).await;
        }
    }

    /// Register `name` on a claimed port and bring the forward up
    async fn launch(
        &self,
        name: String,
        host: &str,
        key_path: &Path,
        local_port: u16,
        remote_port: u16,
    ) -> Result<u16, TunnelError> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Starting);

        let raced = match self.inner.tunnels.entry(name.clone()) {
            Entry::Occupied(entry) => Some((entry.get().local_port, entry.get().ready.clone())),
            Entry::Vacant(entry) => {
                entry.insert(TunnelRecord {
                    generation,
                    local_port,
                    remote_port,
                    host: host.to_string(),
                    pid: None,
                    started_at: current_time_millis(),
                    cancel: cancel.clone(),
                    ready: ready_rx,
                });
                None
            }
        };

        if let Some((port, ready)) = raced {
            self.inner.claimed.remove(&local_port);
            wait_ready(&name, port, ready).await?;
            return Ok(port);
        }

        let spec = ForwardSpec {
            key: name,
            host: host.to_string(),
            key_path: key_path.to_path_buf(),
            local_port,
            remote_port,
            user: self.settings.user.clone(),
        };

        // Detached so an abandoned caller cannot leave the record half-built
        let manager = self.clone();
        tokio::spawn(async move { manager.bring_up(spec, generation, cancel, ready_tx).await })
            .await
            .map_err(|e| TunnelError::Spawn(format!("tunnel task failed: {}", e)))?
    }

    async fn bring_up(
        &self,
        spec: ForwardSpec,
        generation: u64,
        cancel: CancellationToken,
        ready_tx: watch::Sender<Readiness>,
    ) -> Result<u16, TunnelError> {
        let key = spec.key.clone();
        let port = spec.local_port;

        let mut process = match self.spawner.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!("Failed to start tunnel {}: {}", key, e);
                self.inner.remove_generation(&key, generation);
                self.inner.claimed.remove(&port);
                let _ = ready_tx.send(Readiness::Failed);
                return Err(e);
            }
        };

        let pid = process.pid();
        if let Some(mut record) = self.inner.tunnels.get_mut(&key) {
            if record.generation == generation {
                record.pid = pid;
            }
        }

        let inner = Arc::clone(&self.inner);
        let monitor_cancel = cancel.clone();
        let monitor_key = key.clone();
        self.inner.monitors.spawn(async move {
            let exited = tokio::select! {
                code = process.wait() => Some(code),
                _ = monitor_cancel.cancelled() => None,
            };

            match exited {
                Some(code) => {
                    if inner.remove_generation(&monitor_key, generation) {
                        tracing::warn!(
                            "Tunnel {} exited (code {:?}), removed from registry",
                            monitor_key,
                            code
                        );
                    }
                }
                None => {
                    process.terminate().await;
                    tracing::debug!("Tunnel {} process terminated", monitor_key);
                }
            }

            drop(process);
            inner.claimed.remove(&port);
        });

        if self.verify_listening(&key, generation, port, &cancel).await {
            tracing::info!(
                "Tunnel {} live: localhost:{} -> {}:{} (pid {:?})",
                key,
                port,
                spec.host,
                spec.remote_port,
                pid
            );
            let _ = ready_tx.send(Readiness::Live);
            return Ok(port);
        }

        let stopped = cancel.is_cancelled();
        self.inner.remove_generation(&key, generation);
        cancel.cancel();
        let _ = ready_tx.send(Readiness::Failed);

        if stopped {
            Err(TunnelError::Stopped(key))
        } else {
            tracing::error!("Tunnel {} is not listening on port {}", key, port);
            Err(TunnelError::NotListening { key, port })
        }
    }

    /// Poll until the forward holds `port`, it exits, or the settle time ends
    async fn verify_listening(
        &self,
        key: &str,
        generation: u64,
        port: u16,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.settings.settle_timeout;

        loop {
            if cancel.is_cancelled() || !self.inner.is_current(key, generation) {
                return false;
            }
            if port_in_use(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(VERIFY_POLL).await;
        }
    }
}

fn snapshot(key: &str, record: &TunnelRecord) -> TunnelInfo {
    TunnelInfo {
        key: key.to_string(),
        local_port: record.local_port,
        remote_port: record.remote_port,
        host: record.host.clone(),
        pid: record.pid,
        started_at: record.started_at,
    }
}

async fn wait_ready(
    name: &str,
    port: u16,
    mut ready: watch::Receiver<Readiness>,
) -> Result<(), TunnelError> {
    let state = ready
        .wait_for(|state| *state != Readiness::Starting)
        .await
        .map(|state| *state);

    match state {
        Ok(Readiness::Live) => Ok(()),
        Ok(_) => Err(TunnelError::NotListening {
            key: name.to_string(),
            port,
        }),
        Err(_) => Err(TunnelError::Stopped(name.to_string())),
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn port_in_use(port: u16) -> bool {
    matches!(
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)),
        Err(e) if e.kind() == ErrorKind::AddrInUse
    )
}
