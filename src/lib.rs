//! # procrun
//!
//! **Process-backed container runtime for a training agent**
//!
//! Runs containerized workloads as supervised OS processes, launched
//! through Singularity/Apptainer (or directly on the host), behind a
//! backend-agnostic runtime interface. Containers started by one agent
//! instance can be picked up again by the next one after a restart.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            procrun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 ContainerRuntime Trait                      │    │
//! │  │   pull → create(id, spec) → run(id) → signal / remove       │    │
//! │  │             list(filter)      reattach(id)                  │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                   ProcessRuntime                          │      │
//! │  │  ContainerRegistry (mutex) │ StateStore (atomic rename)   │      │
//! │  │  StagingDir + bootstrap    │ TaskTracker work group       │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │  procrun-shim (pid == pgid) → singularity run ... <cmd>   │      │
//! │  │  stdout/stderr → log pumps → Publisher                    │      │
//! │  │  exit status → exit.json (recoverable after restart)      │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   ┌─────────┐  create  ┌─────────┐  run   ┌─────────┐  exit   ┌────────┐
//!   │ (none)  │ ───────► │ Created │ ─────► │ Running │ ──────► │ Exited │
//!   └─────────┘          └─────────┘        └────┬────┘         └────────┘
//!                                                │ remove(force)
//!     agent restart ──► Restored ── reattach ──► │
//!                                                ▼
//!                                           ┌─────────┐
//!                                           │ Removed │
//!                                           └─────────┘
//! ```
//!
//! # Bounded Resources
//!
//! - `MAX_CONTAINERS`: 1024 records per runtime
//! - `MAX_STAGED_BYTES`: 1 GiB of archive content per container
//! - `MAX_LOG_LINE_LEN`: 64 KiB per log event, longer lines are split
//! - `PUBLISH_TIMEOUT`: 5 s back-pressure on a full event channel
//!
//! # Example
//!
//! ```rust,ignore
//! use procrun::{Config, ContainerId, ContainerRuntime, ProcessRuntime, RunSpec};
//! use procrun::events::ChannelPublisher;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> procrun::Result<()> {
//!     let runtime = ProcessRuntime::new(Config::from_env()?)?;
//!     let (publisher, mut events) = ChannelPublisher::channel(256);
//!     let publisher = Arc::new(publisher);
//!
//!     let id = ContainerId::generate();
//!     let spec = RunSpec::new("docker://python:3.11", vec!["python3".into(), "train.py".into()]);
//!     runtime.create_container(&id, spec, publisher.clone()).await?;
//!     let container = runtime.run_container(&id, publisher).await?;
//!     let completion = container.waiter.wait().await?;
//!     println!("{completion:?}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logs;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod shim;
pub mod spec;
pub mod staging;
pub mod storage;

pub mod runtimes;

// Re-exports
pub use config::Config;
pub use constants::*;
pub use error::{Error, Result};
pub use events::{ChannelPublisher, Event, LogLevel, LogStream, Publisher, StatsKind};
pub use runtime::{
    Completion, Container, ContainerId, ContainerRuntime, ContainerSummary, ContainerWaiter,
    ExitError, ExitOutcome, ListFilter, Signal,
};
pub use runtimes::{ImageTool, ProcessRuntime, RuntimeRegistry};
pub use spec::{ArchiveItem, DeviceRequest, ItemKind, PullRequest, RunArchive, RunSpec};
