//! Tests for image pulls.
//!
//! The image tool is replaced by `/bin/sh`: the runtime runs
//! `/bin/sh pull [--force] <image>` in the image cache directory, which
//! executes a `pull` script written there by each test.

mod common;

use async_trait::async_trait;
use common::*;
use procrun::{
    ContainerRuntime, Error, Event, ImageTool, LogLevel, LogStream, ProcessRuntime, Publisher,
    PullRequest, Result, StatsKind,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Runtime whose image tool runs `script` as its `pull` subcommand.
fn runtime_with_tool(tmp: &TempDir, script: &str) -> ProcessRuntime {
    let config = host_config(tmp.path())
        .with_tool(ImageTool::Singularity)
        .with_tool_path("/bin/sh");
    std::fs::create_dir_all(&config.image_cache_dir).unwrap();
    std::fs::write(config.image_cache_dir.join("pull"), script).unwrap();
    ProcessRuntime::new(config).unwrap()
}

fn collect(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn logs(events: &[Event]) -> Vec<(LogLevel, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Log {
                level,
                stream,
                message,
                ..
            } => {
                assert_eq!(*stream, LogStream::Runtime);
                Some((*level, message.clone()))
            }
            _ => None,
        })
        .collect()
}

fn assert_bracketed(events: &[Event]) {
    assert!(
        matches!(
            events.first(),
            Some(Event::BeginStats {
                kind: StatsKind::ImagePull,
                ..
            })
        ),
        "first event should begin the pull span: {events:?}"
    );
    assert!(
        matches!(
            events.last(),
            Some(Event::EndStats {
                kind: StatsKind::ImagePull,
                ..
            })
        ),
        "last event should end the pull span: {events:?}"
    );
}

// =============================================================================
// Success Paths
// =============================================================================

#[tokio::test]
async fn test_pull_success_publishes_output() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(
        &tmp,
        "echo \"args: $*\"\necho 'INFO:    Converting OCI blobs to SIF format' >&2\nexit 0\n",
    );
    let (publisher, mut rx) = channel();

    rt.pull_image(&PullRequest::new("docker://python:3.11"), publisher)
        .await
        .unwrap();

    let events = collect(&mut rx);
    assert_bracketed(&events);
    assert_eq!(
        logs(&events),
        vec![
            (LogLevel::Info, "args: docker://python:3.11".to_string()),
            (LogLevel::Info, "Converting OCI blobs to SIF format".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_pull_runs_in_image_cache_dir() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(&tmp, "touch pulled.sif\n");

    rt.pull_image(&PullRequest::new("docker://alpine"), discard())
        .await
        .unwrap();
    assert!(rt.config().image_cache_dir.join("pulled.sif").exists());
}

#[tokio::test]
async fn test_force_pull_passes_flag() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(&tmp, "echo \"args: $*\"\n");
    let (publisher, mut rx) = channel();

    let req = PullRequest {
        name: "docker://alpine".into(),
        force_pull: true,
    };
    rt.pull_image(&req, publisher).await.unwrap();

    assert_eq!(
        logs(&collect(&mut rx)),
        vec![(LogLevel::Info, "args: --force docker://alpine".to_string())]
    );
}

#[tokio::test]
async fn test_existing_image_is_success() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(
        &tmp,
        "echo 'FATAL:   Image file already exists: \"alpine_latest.sif\" - will not overwrite' >&2\nexit 255\n",
    );
    let (publisher, mut rx) = channel();

    rt.pull_image(&PullRequest::new("docker://alpine"), publisher)
        .await
        .unwrap();

    let events = collect(&mut rx);
    assert_bracketed(&events);
    let lines = logs(&events);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].0, LogLevel::Info);
    assert!(lines[0].1.starts_with("Image file already exists"));
}

#[tokio::test]
async fn test_cached_image_pulled_twice_succeeds_both_times() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(
        &tmp,
        "if [ -e alpine_latest.sif ]; then\n  echo 'FATAL:   Image file already exists: \"alpine_latest.sif\" - will not overwrite' >&2\n  exit 255\nfi\ntouch alpine_latest.sif\n",
    );
    std::fs::write(rt.config().image_cache_dir.join("alpine_latest.sif"), b"").unwrap();
    let (publisher, mut rx) = channel();
    let req = PullRequest::new("docker://alpine");

    for _ in 0..2 {
        rt.pull_image(&req, publisher.clone()).await.unwrap();
        let events = collect(&mut rx);
        assert_bracketed(&events);
        assert_eq!(events.len(), 3, "events: {events:?}");
        let lines = logs(&events);
        assert_eq!(lines[0].0, LogLevel::Info);
        assert!(lines[0].1.starts_with("Image file already exists"));
    }
}

#[tokio::test]
async fn test_host_tool_pull_is_noop() {
    let tmp = TempDir::new().unwrap();
    let rt = ProcessRuntime::new(host_config(tmp.path())).unwrap();
    let (publisher, mut rx) = channel();

    rt.pull_image(&PullRequest::new("docker://ignored"), publisher)
        .await
        .unwrap();

    let events = collect(&mut rx);
    assert_eq!(events.len(), 2);
    assert_bracketed(&events);
    assert!(!rt.config().image_cache_dir.exists());
}

// =============================================================================
// Failure Paths
// =============================================================================

#[tokio::test]
async fn test_pull_failure_is_retryable_error() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(
        &tmp,
        "echo 'INFO:    Fetching manifest' >&2\necho 'FATAL:   While making image from oci registry: manifest unknown' >&2\nexit 255\n",
    );
    let (publisher, mut rx) = channel();

    let err = rt
        .pull_image(&PullRequest::new("docker://nope:missing"), publisher)
        .await
        .unwrap_err();
    match &err {
        Error::ImagePullFailed { reference, reason } => {
            assert_eq!(reference, "docker://nope:missing");
            assert!(reason.contains("manifest unknown"), "reason: {reason}");
            assert!(reason.contains("255"), "reason: {reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());

    let events = collect(&mut rx);
    assert_bracketed(&events);
    assert_eq!(
        logs(&events).last().map(|(level, _)| *level),
        Some(LogLevel::Critical)
    );
}

#[tokio::test]
async fn test_missing_tool_fails_pull() {
    let tmp = TempDir::new().unwrap();
    let config = host_config(tmp.path())
        .with_tool(ImageTool::Apptainer)
        .with_tool_path("/nonexistent/apptainer");
    let rt = ProcessRuntime::new(config).unwrap();
    let (publisher, mut rx) = channel();

    let err = rt
        .pull_image(&PullRequest::new("docker://alpine"), publisher)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImagePullFailed { .. }));
    assert_bracketed(&collect(&mut rx));
}

#[tokio::test]
async fn test_empty_image_reference_fails() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(&tmp, "exit 0\n");

    let err = rt
        .pull_image(&PullRequest::new(""), discard())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImagePullFailed { .. }));
}

/// Publisher that rejects every event.
struct ClosedPublisher;

#[async_trait]
impl Publisher for ClosedPublisher {
    async fn publish(&self, _event: Event) -> Result<()> {
        Err(Error::PublishFailed("channel closed".into()))
    }
}

#[tokio::test]
async fn test_begin_publish_failure_aborts_pull() {
    let tmp = TempDir::new().unwrap();
    let rt = runtime_with_tool(&tmp, "touch pulled.sif\n");

    let err = rt
        .pull_image(&PullRequest::new("docker://alpine"), Arc::new(ClosedPublisher))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PublishFailed(_)));
    assert!(!rt.config().image_cache_dir.join("pulled.sif").exists());
}
