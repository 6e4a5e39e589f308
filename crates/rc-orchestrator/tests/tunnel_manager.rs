//! Tunnel manager integration tests
//!
//! Forwards are replaced by a fake that listens on the claimed local port, so
//! the manager's own listen verification runs unchanged.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::timeout;

use rc_core::{InstanceName, TunnelKey};
use rc_orchestrator::tunnel::{
    ForwardProcess, ForwardSpawner, ForwardSpec, TunnelError, TunnelManager, TunnelSettings,
};

/// Each test gets its own block of local ports
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

fn port_block(span: u16) -> u16 {
    let offset = PORT_COUNTER.fetch_add(span, Ordering::SeqCst);
    41000 + offset
}

#[derive(Clone, Copy)]
enum Behavior {
    Listen,
    Silent,
}

struct FakeSpawner {
    behavior: Behavior,
    spawned: AtomicUsize,
    crashes: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl FakeSpawner {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            spawned: AtomicUsize::new(0),
            crashes: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Make the forward for `key` exit on its own
    fn crash(&self, key: &str) {
        if let Some(tx) = self.crashes.lock().unwrap().remove(key) {
            let _ = tx.send(());
        }
    }
}

struct FakeProcess {
    listener: Option<TcpListener>,
    crash: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl ForwardProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.crash.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
        self.listener = None;
        Some(255)
    }

    async fn terminate(&mut self) {
        self.listener = None;
    }
}

#[async_trait]
impl ForwardSpawner for FakeSpawner {
    async fn spawn(&self, spec: &ForwardSpec) -> Result<Box<dyn ForwardProcess>, TunnelError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let listener = match self.behavior {
            Behavior::Listen => Some(
                TcpListener::bind((Ipv4Addr::LOCALHOST, spec.local_port))
                    .map_err(|e| TunnelError::Spawn(e.to_string()))?,
            ),
            Behavior::Silent => None,
        };

        let (tx, rx) = oneshot::channel();
        self.crashes.lock().unwrap().insert(spec.key.clone(), tx);

        Ok(Box::new(FakeProcess {
            listener,
            crash: Some(rx),
        }))
    }
}

fn manager(spawner: Arc<FakeSpawner>, base_port: u16, span: u16) -> TunnelManager {
    TunnelManager::new(
        spawner,
        TunnelSettings {
            user: "root".to_string(),
            base_port,
            port_span: span,
            settle_timeout: Duration::from_millis(500),
        },
    )
}

fn key(name: &str) -> TunnelKey {
    TunnelKey::primary(InstanceName::new(name).unwrap())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_start_tunnel_is_idempotent() {
    let base = port_block(10);
    let spawner = FakeSpawner::new(Behavior::Listen);
    let tunnels = manager(Arc::clone(&spawner), base, 10);
    let alpha = key("alpha");

    let port = tunnels
        .start_tunnel(&alpha, "203.0.113.7", Path::new("/keys/alpha_key"), 7745)
        .await
        .unwrap();
    assert!((base..base + 10).contains(&port));
    assert!(tunnels.is_active(&alpha));
    assert_eq!(tunnels.get_port(&alpha), Some(port));

    let again = tunnels
        .start_tunnel(&alpha, "203.0.113.7", Path::new("/keys/alpha_key"), 7745)
        .await
        .unwrap();
    assert_eq!(again, port);
    assert_eq!(spawner.spawn_count(), 1);

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_ports() {
    let base = port_block(10);
    let tunnels = manager(FakeSpawner::new(Behavior::Listen), base, 10);

    let a = tunnels
        .start_tunnel(&key("alpha"), "203.0.113.7", Path::new("/k"), 7745)
        .await
        .unwrap();
    let b = tunnels
        .start_tunnel(&key("beta"), "203.0.113.8", Path::new("/k"), 7746)
        .await
        .unwrap();
    assert_ne!(a, b);

    assert_eq!(tunnels.get_active_keys(), vec!["alpha", "beta"]);
    let list = tunnels.list();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].key, "alpha");
    assert_eq!(list[0].local_port, a);
    assert_eq!(list[1].remote_port, 7746);

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_starts_share_one_forward() {
    let base = port_block(10);
    let spawner = FakeSpawner::new(Behavior::Listen);
    let tunnels = manager(Arc::clone(&spawner), base, 10);
    let alpha = key("alpha");

    let (a, b) = tokio::join!(
        tunnels.start_tunnel(&alpha, "203.0.113.7", Path::new("/k"), 7745),
        tunnels.start_tunnel(&alpha, "203.0.113.7", Path::new("/k"), 7745),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(tunnels.len(), 1);

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_stop_tunnel_releases_port() {
    let base = port_block(1);
    let tunnels = manager(FakeSpawner::new(Behavior::Listen), base, 1);
    let alpha = key("alpha");

    let port = tunnels
        .start_tunnel(&alpha, "203.0.113.7", Path::new("/k"), 7745)
        .await
        .unwrap();
    assert!(tunnels.stop_tunnel(&alpha));
    assert!(!tunnels.is_active(&alpha));
    assert_eq!(tunnels.get_port(&alpha), None);
    assert!(!tunnels.stop_tunnel(&alpha));

    // The single port in the range becomes available again once the forward is gone
    let beta = key("beta");
    let mut reused = None;
    for _ in 0..50 {
        match tunnels
            .start_tunnel(&beta, "203.0.113.8", Path::new("/k"), 7746)
            .await
        {
            Ok(port) => {
                reused = Some(port);
                break;
            }
            Err(TunnelError::NoFreePort { .. }) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(reused, Some(port));

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_exited_forward_leaves_registry() {
    let base = port_block(10);
    let spawner = FakeSpawner::new(Behavior::Listen);
    let tunnels = manager(Arc::clone(&spawner), base, 10);
    let alpha = key("alpha");

    tunnels
        .start_tunnel(&alpha, "203.0.113.7", Path::new("/k"), 7745)
        .await
        .unwrap();
    spawner.crash("alpha");

    wait_until(|| !tunnels.is_active(&alpha)).await;
    assert!(tunnels.is_empty());

    // A later start spawns a fresh forward
    tunnels
        .start_tunnel(&alpha, "203.0.113.7", Path::new("/k"), 7745)
        .await
        .unwrap();
    assert_eq!(spawner.spawn_count(), 2);

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_forward_that_never_listens_fails() {
    let base = port_block(10);
    let tunnels = manager(FakeSpawner::new(Behavior::Silent), base, 10);
    let alpha = key("alpha");

    let result = tunnels
        .start_tunnel(&alpha, "203.0.113.7", Path::new("/k"), 7745)
        .await;
    assert!(matches!(result, Err(TunnelError::NotListening { .. })));
    assert!(!tunnels.is_active(&alpha));
    assert!(tunnels.is_empty());

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_fixed_port_in_use_is_rejected() {
    let base = port_block(10);
    let tunnels = manager(FakeSpawner::new(Behavior::Listen), base, 10);

    let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();

    let gateway = TunnelKey::with_purpose(InstanceName::new("alpha").unwrap(), "gateway");
    let result = tunnels
        .start_fixed_port_tunnel(&gateway, "203.0.113.7", Path::new("/k"), port, 18789)
        .await;
    assert_eq!(result, Err(TunnelError::PortInUse(port)));
    assert!(tunnels.is_empty());
}

#[tokio::test]
async fn test_fixed_port_tunnel_uses_requested_port() {
    let base = port_block(2);
    let tunnels = manager(FakeSpawner::new(Behavior::Listen), base, 1);
    let fixed = base + 1;

    let gateway = TunnelKey::with_purpose(InstanceName::new("alpha").unwrap(), "gateway");
    let port = tunnels
        .start_fixed_port_tunnel(&gateway, "203.0.113.7", Path::new("/k"), fixed, 18789)
        .await
        .unwrap();
    assert_eq!(port, fixed);
    assert_eq!(tunnels.get_active_keys(), vec!["alpha:gateway"]);

    tunnels.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_clears_everything() {
    let base = port_block(10);
    let tunnels = manager(FakeSpawner::new(Behavior::Listen), base, 10);

    for name in ["alpha", "beta", "gamma"] {
        tunnels
            .start_tunnel(&key(name), "203.0.113.7", Path::new("/k"), 7745)
            .await
            .unwrap();
    }
    assert_eq!(tunnels.len(), 3);

    assert_eq!(tunnels.stop_all(), 3);
    assert!(tunnels.is_empty());
    assert!(tunnels.get_active_keys().is_empty());

    tunnels.shutdown().await;
}
