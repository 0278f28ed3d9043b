//! Runtime Interface - the backend-agnostic container contract.
//!
//! Every backend implements [`ContainerRuntime`] so the rest of the agent
//! never depends on how a container is executed:
//! - `pull_image`: make an image available locally
//! - `create_container`: prepare an execution recipe, start nothing
//! - `run_container`: launch and return a completion handle
//! - `signal_container`: deliver a signal to the process group
//! - `remove_container`: kill and forget a container
//! - `list_running_containers`: enumerate live containers
//! - `reattach_container`: rebuild a completion handle after a restart
//!
//! # Lifecycle
//!
//! ```text
//!   ┌────────┐  create  ┌─────────┐  run   ┌─────────┐  exit   ┌────────┐
//!   │ (none) │ ───────► │ Created │ ─────► │ Running │ ──────► │ Exited │
//!   └────────┘          └─────────┘        └────┬────┘         └────────┘
//!                                               │ remove(force)
//!        restart ── reattach ──► Running        ▼
//!                                          ┌─────────┐
//!                                          │ Removed │
//!                                          └─────────┘
//! ```

use crate::error::{Error, Result};
use crate::events::Publisher;
use crate::spec::{PullRequest, RunSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;

// =============================================================================
// Container ID
// =============================================================================

/// Opaque container identity, assigned by the caller before create.
///
/// Equality is by value. Records, persisted state and events are all keyed
/// by this token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGQUIT.
    Quit,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    /// Parses from signal name (e.g., "SIGTERM", "TERM", "15").
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "QUIT" | "3" => Some(Self::Quit),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Quit => write!(f, "SIGQUIT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Completion
// =============================================================================

/// Structured description of an abnormal termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitError {
    pub message: String,
}

/// Result of a container process terminating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// Exit status. Synthesized (`128 + signal`, or `-1` if unknown) when
    /// `error` is set.
    pub status_code: i64,
    /// Present only for abnormal termination.
    pub error: Option<ExitError>,
}

impl ExitOutcome {
    /// A normal exit with `code`.
    pub fn exited(code: i64) -> Self {
        Self {
            status_code: code,
            error: None,
        }
    }

    /// An abnormal termination.
    pub fn abnormal(code: i64, message: impl Into<String>) -> Self {
        Self {
            status_code: code,
            error: Some(ExitError {
                message: message.into(),
            }),
        }
    }

    /// Returns true for a normal exit with status 0.
    pub fn success(&self) -> bool {
        self.status_code == 0 && self.error.is_none()
    }
}

/// Final state delivered exactly once per completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The process terminated, normally or not.
    Exited(ExitOutcome),
    /// The container was force-removed while running.
    Removed,
}

/// Single-resolution completion channel for one container.
#[derive(Debug)]
pub struct ContainerWaiter {
    id: ContainerId,
    rx: oneshot::Receiver<Completion>,
}

impl ContainerWaiter {
    /// Creates a connected sender / waiter pair.
    pub fn channel(id: ContainerId) -> (oneshot::Sender<Completion>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    /// Waits for the container to finish.
    ///
    /// Returns [`Error::Detached`] if the runtime stopped watching the
    /// process (shutdown) before it finished.
    pub async fn wait(self) -> Result<Completion> {
        self.rx
            .await
            .map_err(|_| Error::Detached(self.id.to_string()))
    }
}

// =============================================================================
// Container Handle
// =============================================================================

/// Handle returned by run and reattach.
#[derive(Debug)]
pub struct Container {
    /// Container identity.
    pub id: ContainerId,
    /// Process id of the supervised process (also its process group id).
    pub pid: i32,
    /// Network mode (`host` for process-backed containers).
    pub network_mode: String,
    /// Declared exposed ports.
    pub ports: BTreeSet<String>,
    /// Completion channel.
    pub waiter: ContainerWaiter,
}

// =============================================================================
// Listing
// =============================================================================

/// Criteria for [`ContainerRuntime::list_running_containers`].
///
/// Empty criteria match everything. A mismatch is never an error.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only these identities (empty: any).
    pub ids: BTreeSet<ContainerId>,
    /// Labels that must all be present with equal values.
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to one identity.
    pub fn id(mut self, id: impl Into<ContainerId>) -> Self {
        self.ids.insert(id.into());
        self
    }

    /// Requires a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns true if a container matches.
    pub fn matches(&self, id: &ContainerId, labels: &BTreeMap<String, String>) -> bool {
        (self.ids.is_empty() || self.ids.contains(id))
            && self
                .labels
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
    }
}

/// Lightweight information about a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub pid: i32,
    pub image: String,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: String,
    pub ports: BTreeSet<String>,
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Backend-agnostic container runtime.
///
/// Implemented identically by every backend; call sites route through
/// `Arc<dyn ContainerRuntime>`.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Operations on different
/// identities may run concurrently.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &str;

    /// Makes `req.name` available locally.
    ///
    /// Idempotent. An image that is already present is a success, and
    /// begin/end stats events are emitted either way.
    async fn pull_image(&self, req: &PullRequest, publisher: Arc<dyn Publisher>) -> Result<()>;

    /// Prepares a container without starting it.
    ///
    /// Materializes archives and derives the launch recipe. Creating an
    /// identity that already exists replaces the previous record if it was
    /// never started; a started one fails with [`Error::InvalidState`].
    async fn create_container(
        &self,
        id: &ContainerId,
        spec: RunSpec,
        publisher: Arc<dyn Publisher>,
    ) -> Result<()>;

    /// Launches a created container.
    ///
    /// Returns once the workload has started; if it cannot be started the
    /// call fails with [`Error::SpawnFailed`] and the container stays
    /// created. Output is pumped to `publisher`
    /// in the background; completion is observed through the returned
    /// handle. Dropping the returned future or handle never kills the process.
    async fn run_container(
        &self,
        id: &ContainerId,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Container>;

    /// Delivers `signal` to the container's process group without waiting.
    async fn signal_container(&self, id: &ContainerId, signal: Signal) -> Result<()>;

    /// Kills (if needed) and forgets a container, reclaiming its staging
    /// directory.
    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Lists containers with a live process that match `filter`.
    async fn list_running_containers(
        &self,
        filter: &ListFilter,
    ) -> Result<HashMap<ContainerId, ContainerSummary>>;

    /// Rebuilds a completion handle for a container started by an earlier
    /// instance of this runtime.
    ///
    /// Backends without process tracking keep this default, which always
    /// reports the container as not found.
    async fn reattach_container(&self, id: &ContainerId) -> Result<Container> {
        Err(Error::ContainerNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!(Signal::parse("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("TERM"), Some(Signal::Term));
        assert_eq!(Signal::parse("15"), Some(Signal::Term));
        assert_eq!(Signal::parse("sigkill"), Some(Signal::Kill));
        assert_eq!(Signal::parse("quit"), Some(Signal::Quit));
        assert_eq!(Signal::parse("INVALID"), None);
    }

    #[test]
    fn test_list_filter_matching() {
        let id = ContainerId::from("trial-1");
        let mut labels = BTreeMap::new();
        labels.insert("experiment".to_string(), "7".to_string());

        assert!(ListFilter::all().matches(&id, &labels));
        assert!(ListFilter::all().id("trial-1").matches(&id, &labels));
        assert!(!ListFilter::all().id("trial-2").matches(&id, &labels));
        assert!(ListFilter::all().label("experiment", "7").matches(&id, &labels));
        assert!(!ListFilter::all().label("experiment", "8").matches(&id, &labels));
        assert!(!ListFilter::all().label("trial", "1").matches(&id, &labels));
    }

    #[test]
    fn test_exit_outcome() {
        assert!(ExitOutcome::exited(0).success());
        assert!(!ExitOutcome::exited(3).success());
        let abnormal = ExitOutcome::abnormal(137, "killed by SIGKILL");
        assert!(!abnormal.success());
        assert_eq!(abnormal.error.unwrap().message, "killed by SIGKILL");
    }

    #[tokio::test]
    async fn test_waiter_reports_detached_when_sender_dropped() {
        let (tx, waiter) = ContainerWaiter::channel(ContainerId::from("c1"));
        drop(tx);
        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, Error::Detached(id) if id == "c1"));
    }

    #[tokio::test]
    async fn test_waiter_delivers_completion() {
        let (tx, waiter) = ContainerWaiter::channel(ContainerId::from("c1"));
        tx.send(Completion::Exited(ExitOutcome::exited(3))).unwrap();
        assert_eq!(
            waiter.wait().await.unwrap(),
            Completion::Exited(ExitOutcome::exited(3))
        );
    }
}
