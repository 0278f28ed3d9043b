//! Error types for the container runtime layer.

use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container runtime layer.
///
/// Errors returned synchronously from an operation are caller-facing
/// (`ContainerNotFound`, `InvalidSpec`, `StagingFailed`, `ImagePullFailed`,
/// `SpawnFailed`). Failures that happen after a workload is running are
/// logged and never surface here; abnormal process termination is reported
/// through [`crate::runtime::Completion`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// No container record exists for the identity.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container identity is malformed.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Run specification is missing required fields or is inconsistent.
    #[error("invalid run spec for container '{id}': {reason}")]
    InvalidSpec { id: String, reason: String },

    /// Archive materialization into the staging directory failed.
    #[error("failed to stage archives for container '{id}' at {path}: {reason}")]
    StagingFailed {
        id: String,
        path: PathBuf,
        reason: String,
    },

    /// Operation not valid in the container's current state.
    #[error("container '{id}' is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// The OS refused to start the process.
    #[error("failed to spawn container '{id}': {reason}")]
    SpawnFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Non-forced removal of a container whose process is still alive.
    #[error("container '{0}' is still running; use force to remove it")]
    StillRunning(String),

    /// A completion handle for this container is already outstanding.
    #[error("container '{0}' already has a completion watcher")]
    AlreadyAttached(String),

    /// The runtime stopped waiting before the process finished.
    ///
    /// The process itself is left running.
    #[error("stopped waiting on container '{0}': runtime shut down")]
    Detached(String),

    /// Runtime-wide capacity exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Image pull failed (network, registry or tool failure). Retryable.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    // =========================================================================
    // Plumbing Errors
    // =========================================================================
    /// Runtime configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Event publisher rejected or timed out on an event.
    #[error("failed to publish event: {0}")]
    PublishFailed(String),

    /// Persisted state file could not be read or written.
    #[error("state file {path}: {reason}")]
    StateFailed { path: PathBuf, reason: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error means the identity is unknown.
    ///
    /// Callers typically treat this as "already cleaned up".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ImagePullFailed { .. } | Self::PublishFailed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
