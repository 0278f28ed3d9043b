//! Tests for error types.
//!
//! Checks caller-facing messages and the classification helpers the agent
//! uses to decide between retry and cleanup.

use procrun::Error;
use std::path::PathBuf;

// =============================================================================
// Display Tests
// =============================================================================

#[test]
fn test_not_found_message() {
    let err = Error::ContainerNotFound("trial-1".into());
    assert_eq!(err.to_string(), "container not found: trial-1");
}

#[test]
fn test_invalid_state_message() {
    let err = Error::InvalidState {
        id: "trial-1".into(),
        state: "running".into(),
        expected: "created".into(),
    };
    assert_eq!(
        err.to_string(),
        "container 'trial-1' is running, expected created"
    );
}

#[test]
fn test_staging_failed_includes_path() {
    let err = Error::StagingFailed {
        id: "trial-1".into(),
        path: PathBuf::from("/var/tmp/procrun/trial-1-abcd"),
        reason: "disk full".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("trial-1"));
    assert!(msg.contains("/var/tmp/procrun/trial-1-abcd"));
    assert!(msg.contains("disk full"));
}

#[test]
fn test_pull_failed_includes_reference() {
    let err = Error::ImagePullFailed {
        reference: "docker://python:3.11".into(),
        reason: "exit status: 255 (manifest unknown)".into(),
    };
    assert!(err.to_string().contains("docker://python:3.11"));
    assert!(err.to_string().contains("manifest unknown"));
}

// =============================================================================
// Classification Tests
// =============================================================================

#[test]
fn test_is_not_found() {
    assert!(Error::ContainerNotFound("x".into()).is_not_found());
    assert!(!Error::StillRunning("x".into()).is_not_found());
    assert!(!Error::Detached("x".into()).is_not_found());
}

#[test]
fn test_is_retryable() {
    assert!(
        Error::ImagePullFailed {
            reference: "img".into(),
            reason: "network".into(),
        }
        .is_retryable()
    );
    assert!(Error::PublishFailed("timeout".into()).is_retryable());
    assert!(
        !Error::InvalidSpec {
            id: "x".into(),
            reason: "command is empty".into(),
        }
        .is_retryable()
    );
    assert!(!Error::ContainerNotFound("x".into()).is_retryable());
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_from_io_error() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("denied"));
}

#[test]
fn test_from_json_error() {
    let json = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: Error = json.into();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn test_error_is_send_sync() {
    fn assert_send_sync<T: Send + Sync + 'static>() {}
    assert_send_sync::<Error>();
}
