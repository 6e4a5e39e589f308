//! Gateway service control tests
//!
//! The provisioning script is a temporary shell script; status probes go
//! through a fake SSH connector.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use rc_core::artifact::InstanceStore;
use rc_core::config::DashboardConfig;
use rc_core::{ArtifactError, InstanceName};
use rc_orchestrator::service::{ServiceAction, ServiceControl, ServiceError, ServiceStatus};

use common::{write_instance, write_script, FakeConnector};

const STATUS_REPLY: (&str, &str) = ("systemctl --user is-active", "active\nenabled");

struct Setup {
    dir: tempfile::TempDir,
    connector: Arc<FakeConnector>,
    service: ServiceControl,
}

fn setup(script: &str, timeout: Duration) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    write_instance(dir.path(), "alpha", "127.0.0.1");
    write_script(&dir.path().join("run-hetzner.sh"), script);

    let mut config = DashboardConfig::default();
    config.project_root = dir.path().to_path_buf();
    config.service.script_timeout = timeout;

    let store = InstanceStore::new(config.instances_path(), dir.path());
    let connector = Arc::new(FakeConnector::replying(vec![STATUS_REPLY]));
    let service = ServiceControl::new(store, connector.clone(), &config);

    Setup {
        dir,
        connector,
        service,
    }
}

fn alpha() -> InstanceName {
    InstanceName::new("alpha").unwrap()
}

#[tokio::test]
async fn test_status_probes_the_unit() {
    let s = setup("exit 0", Duration::from_secs(5));

    let status = s.service.status(&alpha()).await.unwrap();
    assert_eq!(
        status,
        ServiceStatus {
            status: "active".to_string(),
            enabled: true
        }
    );
    assert_eq!(s.connector.executed().len(), 1);
}

#[tokio::test]
async fn test_apply_runs_script_then_probes() {
    let s = setup(
        r#"echo "$@" >> calls.txt
echo "gateway $3""#,
        Duration::from_secs(5),
    );

    let status = s.service.apply(&alpha(), ServiceAction::Start).await.unwrap();
    assert_eq!(status.status, "active");
    assert!(status.enabled);

    let calls = std::fs::read_to_string(s.dir.path().join("calls.txt")).unwrap();
    assert_eq!(calls.trim(), "service alpha started");

    // The reported state comes from the instance, after the script ran
    let executed = s.connector.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("systemctl --user is-active openclaw-gateway"));

    s.service.apply(&alpha(), ServiceAction::Stop).await.unwrap();
    let calls = std::fs::read_to_string(s.dir.path().join("calls.txt")).unwrap();
    assert_eq!(
        calls.lines().collect::<Vec<_>>(),
        vec!["service alpha started", "service alpha stopped"]
    );
}

#[tokio::test]
async fn test_failing_script_skips_probe() {
    let s = setup("echo boom >&2\nexit 3", Duration::from_secs(5));

    let err = s
        .service
        .apply(&alpha(), ServiceAction::Stop)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Script(_)));
    assert!(err.to_string().contains("boom"));
    assert!(s.connector.executed().is_empty());
}

#[tokio::test]
async fn test_slow_script_times_out() {
    let s = setup("sleep 10", Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = s
        .service
        .apply(&alpha(), ServiceAction::Start)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(s.connector.executed().is_empty());
}

#[tokio::test]
async fn test_unknown_instance_runs_nothing() {
    let s = setup(r#"touch ran.txt"#, Duration::from_secs(5));
    let ghost = InstanceName::new("ghost").unwrap();

    let err = s
        .service
        .apply(&ghost, ServiceAction::Start)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Artifact(ArtifactError::NotFound(_))
    ));
    assert!(!s.dir.path().join("ran.txt").exists());
}
