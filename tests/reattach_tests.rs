//! Tests for recovering containers after an agent restart.
//!
//! A restart is simulated by shutting one runtime down and opening a second
//! one on the same state file. The containers' processes keep running in
//! between.

mod common;

use async_trait::async_trait;
use common::*;
use procrun::process::ProcessIdentity;
use procrun::runtimes::LaunchPlan;
use procrun::storage::{PersistedRecord, StateSnapshot, StateStore};
use procrun::{
    Completion, Container, ContainerId, ContainerRuntime, ContainerSummary, Error, ExitOutcome,
    ListFilter, ProcessRuntime, PullRequest, Publisher, Result, RunSpec, RuntimeRegistry, Signal,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Script that exits with `code` once `gate` exists.
fn gated(gate: &Path, code: i32) -> RunSpec {
    sh(&format!(
        "echo ready; while [ ! -e '{}' ]; do sleep 0.05; done; exit {code}",
        gate.display()
    ))
}

/// Starts `id` on a first runtime, then detaches from it.
async fn start_and_detach(tmp: &TempDir, id: &ContainerId, spec: RunSpec) -> i32 {
    let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    let (publisher, mut rx) = channel();
    rt.create_container(id, spec, discard()).await.unwrap();
    let container = rt.run_container(id, publisher).await.unwrap();
    wait_for_line(&mut rx, "ready").await;

    rt.shutdown();
    rt.wait_idle().await;
    assert!(matches!(
        container.waiter.wait().await,
        Err(Error::Detached(_))
    ));
    container.pid
}

// =============================================================================
// Reattach Tests
// =============================================================================

#[tokio::test]
async fn test_reattach_recovers_exit_status() {
    let tmp = TempDir::new().unwrap();
    let gate = tmp.path().join("gate");
    let id = ContainerId::from("survivor");
    let pid = start_and_detach(&tmp, &id, gated(&gate, 7)).await;

    let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    let running = rt.list_running_containers(&ListFilter::all()).await.unwrap();
    assert_eq!(running[&id].pid, pid);

    let container = rt.reattach_container(&id).await.unwrap();
    assert_eq!(container.pid, pid);
    assert_eq!(container.network_mode, "host");

    std::fs::write(&gate, b"").unwrap();
    assert_eq!(
        wait(container.waiter).await,
        Completion::Exited(ExitOutcome::exited(7))
    );
    assert!(rt.list_running_containers(&ListFilter::all()).await.unwrap().is_empty());

    // The finished container is gone from the state file as well.
    let reopened = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    assert!(reopened.reattach_container(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_reattach_twice_is_already_attached() {
    let tmp = TempDir::new().unwrap();
    let id = ContainerId::from("attached");
    start_and_detach(&tmp, &id, sh("echo ready; exec sleep 30")).await;

    let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    let container = rt.reattach_container(&id).await.unwrap();
    let err = rt.reattach_container(&id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyAttached(_)));

    rt.remove_container(&id, true).await.unwrap();
    assert_eq!(wait(container.waiter).await, Completion::Removed);
}

#[tokio::test]
async fn test_restored_container_can_be_signalled_and_removed() {
    let tmp = TempDir::new().unwrap();
    let id = ContainerId::from("restored");
    let pid = start_and_detach(&tmp, &id, sh("echo ready; exec sleep 30")).await;

    let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    let err = rt.remove_container(&id, false).await.unwrap_err();
    assert!(matches!(err, Error::StillRunning(_)));

    rt.signal_container(&id, Signal::Kill).await.unwrap();
    let process = ProcessIdentity {
        pid,
        start_time: None,
    };
    tokio::time::timeout(TEST_TIMEOUT, async {
        while process.is_alive() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("killed container did not exit");

    // Dead and never reattached: signals are a no-op and removal needs no force.
    rt.signal_container(&id, Signal::Term).await.unwrap();
    rt.remove_container(&id, false).await.unwrap();
    assert!(rt.remove_container(&id, false).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_created_container_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let id = ContainerId::from("pending");
    {
        let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
        rt.create_container(&id, sh("echo resumed; exit 4"), discard())
            .await
            .unwrap();
    }

    let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    let err = rt.reattach_container(&id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    let (publisher, mut rx) = channel();
    let container = rt.run_container(&id, publisher).await.unwrap();
    assert_eq!(
        wait(container.waiter).await,
        Completion::Exited(ExitOutcome::exited(4))
    );
    assert_eq!(
        drain_lines(&mut rx, procrun::LogStream::Stdout),
        vec!["resumed"]
    );
}

// =============================================================================
// Revalidation Tests
// =============================================================================

#[tokio::test]
async fn test_dead_process_is_dropped_on_load() {
    let tmp = TempDir::new().unwrap();
    let config = host_config(tmp.path());

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();

    let staging = config.staging_root.join("gone-deadbeef");
    std::fs::create_dir_all(staging.join("stage")).unwrap();

    let mut snapshot = StateSnapshot::new();
    snapshot.insert(
        ContainerId::from("gone"),
        PersistedRecord {
            pid: Some(pid),
            // Never matches, in case the pid was reused.
            start_time: Some(1),
            launch: LaunchPlan {
                argv: vec!["true".into()],
                ..Default::default()
            },
            spec: RunSpec::new("", vec!["true".into()]),
            network_mode: "host".into(),
            ports: Default::default(),
            staging_dir: staging.clone(),
        },
    );
    StateStore::new(config.state_file.clone())
        .save(1, &snapshot)
        .unwrap();

    let rt = ProcessRuntime::new(config.clone()).unwrap();
    assert!(rt.reattach_container(&ContainerId::from("gone")).await.unwrap_err().is_not_found());
    assert!(!staging.exists());

    let persisted = StateStore::new(config.state_file).load().unwrap();
    assert!(persisted.is_empty());
}

#[tokio::test]
async fn test_corrupt_state_file_fails_startup() {
    let tmp = TempDir::new().unwrap();
    let config = host_config(tmp.path());
    std::fs::write(&config.state_file, b"not json").unwrap();

    let err = ProcessRuntime::new(config).err().unwrap();
    assert!(matches!(err, Error::StateFailed { .. }));
}

// =============================================================================
// Backend Registry Tests
// =============================================================================

/// Backend without process tracking.
struct NullRuntime;

#[async_trait]
impl ContainerRuntime for NullRuntime {
    fn name(&self) -> &str {
        "null"
    }

    async fn pull_image(&self, _req: &PullRequest, _publisher: Arc<dyn Publisher>) -> Result<()> {
        Ok(())
    }

    async fn create_container(
        &self,
        _id: &ContainerId,
        _spec: RunSpec,
        _publisher: Arc<dyn Publisher>,
    ) -> Result<()> {
        Ok(())
    }

    async fn run_container(
        &self,
        id: &ContainerId,
        _publisher: Arc<dyn Publisher>,
    ) -> Result<Container> {
        Err(Error::ContainerNotFound(id.to_string()))
    }

    async fn signal_container(&self, id: &ContainerId, _signal: Signal) -> Result<()> {
        Err(Error::ContainerNotFound(id.to_string()))
    }

    async fn remove_container(&self, id: &ContainerId, _force: bool) -> Result<()> {
        Err(Error::ContainerNotFound(id.to_string()))
    }

    async fn list_running_containers(
        &self,
        _filter: &ListFilter,
    ) -> Result<HashMap<ContainerId, ContainerSummary>> {
        Ok(HashMap::new())
    }
}

#[tokio::test]
async fn test_default_reattach_is_not_found() {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(NullRuntime);
    let err = runtime
        .reattach_container(&ContainerId::from("anything"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_runtime_registry_lookup() {
    let tmp = TempDir::new().unwrap();
    let mut registry = RuntimeRegistry::new();
    registry.register(Arc::new(NullRuntime));
    registry.register(Arc::new(
        ProcessRuntime::new(host_config(tmp.path())).unwrap(),
    ));
    registry.register(Arc::new(NullRuntime));

    assert_eq!(registry.names(), vec!["host", "null"]);
    assert_eq!(registry.all().len(), 2);
    assert!(registry.get("singularity").is_none());

    let host = registry.get("host").unwrap();
    let id = ContainerId::from("via-registry");
    host.create_container(&id, sh("exit 0"), discard()).await.unwrap();
    let container = host.run_container(&id, discard()).await.unwrap();
    assert!(matches!(wait(container.waiter).await, Completion::Exited(o) if o.success()));
}
