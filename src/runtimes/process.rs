//! # Process-Backed Runtime
//!
//! Implements [`ContainerRuntime`] by running each container as one OS
//! process, launched through an image tool (`singularity`, `apptainer`) or
//! directly on the host.
//!
//! ## Process Tree
//!
//! ```text
//! agent (ProcessRuntime)
//!   └── procrun-shim          session + process group leader, pid == pgid
//!         └── singularity run ... <cmd>      the workload
//! ```
//!
//! Signals go to the whole group, so they reach the workload and anything it
//! spawned. The shim survives them and exits the way the workload did.
//!
//! `run_container` returns only after the shim has reported on its status
//! pipe that the workload started. If it could not be started, the shim is
//! reaped, the record goes back to created and the caller gets
//! [`Error::SpawnFailed`]; the container is never listed as running.
//!
//! ## Background Tasks
//!
//! Per running container, all in the runtime's [`TaskTracker`]:
//!
//! | Task   | Ends when                                          |
//! |--------|----------------------------------------------------|
//! | stdout | pipe EOF (shim exit) or cancellation               |
//! | stderr | pipe EOF (shim exit) or cancellation               |
//! | wait   | shim exit (after both pumps finish) or cancellation |
//!
//! A reattached container has a single poll task instead; its output pipes
//! belonged to the previous agent and are not recovered.
//!
//! Cancellation ([`ProcessRuntime::shutdown`], or dropping the runtime)
//! detaches: processes keep running, waiters get [`Error::Detached`].
//!
//! ## Completion
//!
//! When the workload exits, the wait task deletes the record (only if it
//! still has the generation the task was started for), persists state,
//! removes the staging directory, and only then delivers the completion.
//! If the record is already gone, the container was removed and the waiter
//! gets [`Completion::Removed`].
//!
//! ## Removal Policy
//!
//! `remove_container(id, false)` on a live process fails with
//! [`Error::StillRunning`]. With `force` the group is sent `SIGKILL`.
//! Containers that never ran, or whose process is gone, are removed either
//! way.
//!
//! ## Re-creating an Identity
//!
//! `create_container` replaces a record that was created but never run. A
//! record with a process (running or restored) is left alone and the call
//! fails with [`Error::InvalidState`] until the container is removed.
//!
//! ## Persistence
//!
//! The registry is snapshotted under its lock; the state file write (temp
//! file, sync, rename) runs on the blocking pool.

use crate::config::Config;
use crate::constants::{HOST_NETWORK_MODE, REATTACH_POLL_INTERVAL, validate_container_id};
use crate::error::{Error, Result};
use crate::events::{Event, LogLevel, LogStream, Publisher, StatsKind};
use crate::logs::spawn_pump;
use crate::process::{ExitRecord, ProcessIdentity, status_pipe, unknown_outcome};
use crate::registry::{ContainerRecord, ContainerRegistry, RecordState};
use crate::runtime::{
    Completion, Container, ContainerId, ContainerRuntime, ContainerSummary, ContainerWaiter,
    ExitOutcome, ListFilter, Signal,
};
use crate::runtimes::tool::LaunchPlan;
use crate::shim::{self, ShimArgs};
use crate::spec::{PullRequest, RunSpec};
use crate::staging::StagingDir;
use crate::storage::StateStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Output marker of an image tool declining to overwrite a cached image.
const IMAGE_EXISTS_MARKER: &str = "Image file already exists";

/// Process-backed container runtime.
pub struct ProcessRuntime {
    shared: Arc<Shared>,
}

/// State shared with background tasks.
struct Shared {
    config: Config,
    registry: ContainerRegistry,
    store: StateStore,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ProcessRuntime {
    /// Creates a runtime, loading and revalidating persisted state.
    ///
    /// Persisted containers whose process is still alive are kept for
    /// [`ContainerRuntime::reattach_container`]. Those whose process is gone
    /// are dropped and their staging reclaimed; their exit status is lost.
    pub fn new(config: Config) -> Result<Self> {
        let store = StateStore::new(config.state_file.clone());
        let registry = ContainerRegistry::new();
        let mut dropped = 0usize;

        for (id, persisted) in store.load()? {
            let record = ContainerRecord::restored(persisted);
            if let Some(process) = record.process
                && !process.is_alive()
            {
                info!(
                    container = %id,
                    pid = process.pid,
                    "Container exited while detached, exit status unknown"
                );
                record.staging.remove();
                dropped += 1;
                continue;
            }
            registry.insert(id, record)?;
        }

        let shared = Arc::new(Shared {
            config,
            registry,
            store,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });
        if dropped > 0 {
            shared.persist_blocking();
        }

        info!(
            tool = %shared.config.tool,
            state_file = %shared.config.state_file.display(),
            restored = shared.registry.len()?,
            dropped,
            "Process runtime initialized"
        );
        Ok(Self { shared })
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Stops watching all containers.
    ///
    /// Tracked tasks are cancelled; the processes keep running and can be
    /// reattached by a later runtime instance.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.tracker.close();
    }

    /// Waits until every tracked task has finished. Returns only after
    /// [`shutdown`](Self::shutdown).
    pub async fn wait_idle(&self) {
        self.shared.tracker.wait().await;
    }

    fn not_found(id: &ContainerId) -> Error {
        Error::ContainerNotFound(id.to_string())
    }

    /// Spawns the shim for `plan`. Returns it with the read end of its
    /// status pipe.
    fn spawn(
        &self,
        id: &ContainerId,
        plan: &LaunchPlan,
        staging: &StagingDir,
    ) -> Result<(Child, OwnedFd)> {
        let spawn_err = |reason: String| Error::SpawnFailed {
            id: id.to_string(),
            reason,
        };
        let (status_read, status_write) =
            status_pipe().map_err(|e| spawn_err(format!("creating status pipe: {e}")))?;
        let status_fd = status_write.as_raw_fd();

        let shim = ShimArgs {
            exit_file: staging.exit_record(),
            status_fd: Some(status_fd),
            argv: plan.argv.clone(),
        };
        let line = shim.to_command_line(&self.shared.config.shim_path.display().to_string());

        let mut cmd = Command::new(&line[0]);
        cmd.args(&line[1..])
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &plan.current_dir {
            cmd.current_dir(dir);
        }

        // SAFETY: setsid and fcntl are async-signal-safe and touch no parent
        // state.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // The shim inherits the write end of its status pipe.
                if libc::fcntl(status_fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!(container = %id, argv = ?line, "Spawning container process");
        let child = cmd
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {e}", line[0])))?;
        // The read only ends once the shim holds the last write end.
        drop(status_write);
        Ok((child, status_read))
    }
}

impl Drop for ProcessRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Waits for the shim to report whether the workload started.
async fn await_start(status: OwnedFd) -> std::result::Result<(), String> {
    let mut report = String::new();
    tokio::fs::File::from_std(std::fs::File::from(status))
        .read_to_string(&mut report)
        .await
        .map_err(|e| format!("reading supervisor status: {e}"))?;
    shim::parse_status(&report)
}

impl Shared {
    /// Writes a registry snapshot from the blocking pool. Failures are
    /// logged.
    async fn persist(self: &Arc<Self>) {
        let (version, snapshot) = match self.registry.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to snapshot container state");
                return;
            }
        };
        let shared = Arc::clone(self);
        let saved =
            tokio::task::spawn_blocking(move || shared.store.save(version, &snapshot)).await;
        match saved {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist container state"),
            Err(e) => warn!(error = %e, "State persistence task failed"),
        }
    }

    /// Writes a registry snapshot on the calling thread. Failures are logged.
    fn persist_blocking(&self) {
        let result = self
            .registry
            .snapshot()
            .and_then(|(version, snapshot)| self.store.save(version, &snapshot));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist container state");
        }
    }

    /// Final step of a watched container: forget it, clean up, deliver.
    async fn finish(
        self: &Arc<Self>,
        id: &ContainerId,
        generation: u64,
        staging: &StagingDir,
        outcome: ExitOutcome,
        tx: oneshot::Sender<Completion>,
    ) {
        let completion = match self.registry.remove_generation(id, generation) {
            Ok(Some(_)) => {
                self.persist().await;
                info!(
                    container = %id,
                    status = outcome.status_code,
                    error = outcome.error.as_ref().map(|e| e.message.as_str()),
                    "Container exited"
                );
                Completion::Exited(outcome)
            }
            Ok(None) => {
                debug!(container = %id, "Container was removed before it exited");
                Completion::Removed
            }
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to forget exited container");
                Completion::Exited(outcome)
            }
        };
        staging.remove();
        if tx.send(completion).is_err() {
            debug!(container = %id, "No one waiting on container completion");
        }
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        self.shared.config.tool.name()
    }

    async fn pull_image(&self, req: &PullRequest, publisher: Arc<dyn Publisher>) -> Result<()> {
        publisher
            .publish(Event::begin_stats(StatsKind::ImagePull))
            .await?;

        let result = self.pull(req, publisher.as_ref()).await;

        if let Err(e) = publisher
            .publish(Event::end_stats(StatsKind::ImagePull))
            .await
        {
            warn!(image = %req.name, error = %e, "Failed to publish image pull end");
        }
        result
    }

    async fn create_container(
        &self,
        id: &ContainerId,
        spec: RunSpec,
        _publisher: Arc<dyn Publisher>,
    ) -> Result<()> {
        validate_container_id(id.as_str()).map_err(|reason| Error::InvalidContainerId {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;
        spec.validate(id.as_str())?;

        let config = &self.shared.config;
        let staging = StagingDir::create(&config.staging_root, id.as_str())?;

        let prepared = async {
            if spec.has_archives() {
                let (staging, key, archives) =
                    (staging.clone(), id.to_string(), spec.archives.clone());
                tokio::task::spawn_blocking(move || staging.materialize(&key, &archives))
                    .await
                    .map_err(|e| Error::Internal(format!("staging task failed: {e}")))??;
            }
            config
                .tool
                .launch_plan(id.as_str(), config.tool_path.as_deref(), &spec, &staging.stage())
        }
        .await;
        let launch = match prepared {
            Ok(launch) => launch,
            Err(e) => {
                staging.remove();
                return Err(e);
            }
        };

        let record = ContainerRecord::created(
            launch,
            spec.without_archives(),
            HOST_NETWORK_MODE.to_string(),
            staging.clone(),
        );
        let inserted = self
            .shared
            .registry
            .insert_replacing_created(id.clone(), record);
        let (generation, replaced) = match inserted {
            Ok(inserted) => inserted,
            Err(e) => {
                staging.remove();
                return Err(e);
            }
        };

        // Only never-started records are replaced, so no process owns it.
        if let Some(old) = replaced {
            old.staging.remove();
            info!(container = %id, "Replaced existing container record");
        }

        self.shared.persist().await;
        info!(
            container = %id,
            generation,
            staging = %staging.path().display(),
            "Created container"
        );
        Ok(())
    }

    async fn run_container(
        &self,
        id: &ContainerId,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Container> {
        let shared = &self.shared;

        // Claim the record so a concurrent run cannot spawn it twice.
        let record = shared
            .registry
            .update(id, |record| match record.state {
                RecordState::Created => {
                    record.state = RecordState::Running;
                    Ok(record.clone())
                }
                other => Err(Error::InvalidState {
                    id: id.to_string(),
                    state: other.to_string(),
                    expected: RecordState::Created.to_string(),
                }),
            })?
            .ok_or_else(|| Self::not_found(id))??;

        let revert = || {
            let _ = shared.registry.update(id, |r| {
                if r.generation == record.generation {
                    r.state = RecordState::Created;
                }
            });
        };

        let (mut child, status) = match self.spawn(id, &record.launch, &record.staging) {
            Ok(spawned) => spawned,
            Err(e) => {
                revert();
                return Err(e);
            }
        };

        if let Err(reason) = await_start(status).await {
            // The shim exits right after reporting.
            if let Err(e) = child.wait().await {
                warn!(container = %id, error = %e, "Failed to reap supervisor");
            }
            revert();
            warn!(container = %id, reason = %reason, "Container failed to start");
            return Err(Error::SpawnFailed {
                id: id.to_string(),
                reason,
            });
        }

        let pid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| Error::Internal(format!("container '{id}' spawned without a pid")))?;
        let identity = ProcessIdentity::capture(pid);
        shared.registry.update(id, |r| {
            if r.generation == record.generation {
                r.process = Some(identity);
            }
        })?;
        shared.persist().await;

        let pumps: Vec<_> = [
            child.stdout.take().map(|out| {
                spawn_pump(
                    &shared.tracker,
                    shared.cancel.clone(),
                    id.clone(),
                    LogStream::Stdout,
                    out,
                    publisher.clone(),
                )
            }),
            child.stderr.take().map(|err| {
                spawn_pump(
                    &shared.tracker,
                    shared.cancel.clone(),
                    id.clone(),
                    LogStream::Stderr,
                    err,
                    publisher.clone(),
                )
            }),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (tx, waiter) = ContainerWaiter::channel(id.clone());
        let task_shared = Arc::clone(shared);
        let task_id = id.clone();
        let staging = record.staging.clone();
        let generation = record.generation;
        shared.tracker.spawn(async move {
            let shared = task_shared;
            let status = tokio::select! {
                () = shared.cancel.cancelled() => {
                    debug!(container = %task_id, pid, "Detached from container");
                    return;
                }
                status = child.wait() => status,
            };
            for pump in pumps {
                let _ = pump.await;
            }

            let outcome = match status {
                Ok(status) => ExitRecord::read(&staging.exit_record())
                    .unwrap_or_else(|| ExitRecord::from_status(status))
                    .outcome(),
                Err(e) => unknown_outcome(&format!("waiting on process: {e}")),
            };
            shared
                .finish(&task_id, generation, &staging, outcome, tx)
                .await;
        });

        info!(container = %id, pid, "Started container");
        Ok(Container {
            id: id.clone(),
            pid,
            network_mode: record.network_mode,
            ports: record.ports,
            waiter,
        })
    }

    async fn signal_container(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        let record = self
            .shared
            .registry
            .get(id)?
            .ok_or_else(|| Self::not_found(id))?;
        let Some(process) = record.process else {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: record.state.to_string(),
                expected: RecordState::Running.to_string(),
            });
        };
        if record.state == RecordState::Restored && !process.is_alive() {
            debug!(container = %id, "Restored container already exited, not signalling");
            return Ok(());
        }

        match process.signal_group(signal.as_i32()) {
            Ok(()) => {
                debug!(container = %id, pid = process.pid, %signal, "Signalled container");
                Ok(())
            }
            // Exited but not yet reaped by its watcher.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::SignalFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        let shared = &self.shared;
        let record = shared.registry.get(id)?.ok_or_else(|| Self::not_found(id))?;
        let live = record.process.filter(|p| p.is_alive());
        if live.is_some() && !force {
            return Err(Error::StillRunning(id.to_string()));
        }

        // Forget first so an exit racing with the kill reports Removed.
        let Some(record) = shared.registry.remove_generation(id, record.generation)? else {
            return Err(Self::not_found(id));
        };
        shared.persist().await;

        if let Some(process) = live {
            match process.signal_group(libc::SIGKILL) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(container = %id, pid = process.pid, error = %e, "Failed to kill container"),
            }
        }
        record.staging.remove();

        info!(container = %id, force, killed = live.is_some(), "Removed container");
        Ok(())
    }

    async fn list_running_containers(
        &self,
        filter: &ListFilter,
    ) -> Result<HashMap<ContainerId, ContainerSummary>> {
        self.shared.registry.running(filter)
    }

    async fn reattach_container(&self, id: &ContainerId) -> Result<Container> {
        let shared = &self.shared;
        let record = shared
            .registry
            .update(id, |record| match record.state {
                RecordState::Restored => {
                    record.state = RecordState::Running;
                    Ok(record.clone())
                }
                RecordState::Running => Err(Error::AlreadyAttached(id.to_string())),
                RecordState::Created => Err(Error::InvalidState {
                    id: id.to_string(),
                    state: RecordState::Created.to_string(),
                    expected: RecordState::Restored.to_string(),
                }),
            })?
            .ok_or_else(|| Self::not_found(id))??;
        let process = record
            .process
            .ok_or_else(|| Error::Internal(format!("restored container '{id}' has no pid")))?;

        let (tx, waiter) = ContainerWaiter::channel(id.clone());
        let task_shared = Arc::clone(shared);
        let task_id = id.clone();
        let staging = record.staging.clone();
        let generation = record.generation;
        shared.tracker.spawn(async move {
            let shared = task_shared;
            let mut interval = tokio::time::interval(REATTACH_POLL_INTERVAL);
            loop {
                tokio::select! {
                    () = shared.cancel.cancelled() => {
                        debug!(container = %task_id, pid = process.pid, "Detached from container");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                if !process.is_alive() {
                    break;
                }
            }

            let outcome = ExitRecord::read(&staging.exit_record())
                .map(|record| record.outcome())
                .unwrap_or_else(|| unknown_outcome("no exit record"));
            shared
                .finish(&task_id, generation, &staging, outcome, tx)
                .await;
        });

        info!(container = %id, pid = process.pid, "Reattached container");
        Ok(Container {
            id: id.clone(),
            pid: process.pid,
            network_mode: record.network_mode,
            ports: record.ports,
            waiter,
        })
    }
}

impl ProcessRuntime {
    /// Runs the tool's pull command, publishing its output.
    async fn pull(&self, req: &PullRequest, publisher: &dyn Publisher) -> Result<()> {
        let config = &self.shared.config;
        let pull_err = |reason: String| Error::ImagePullFailed {
            reference: req.name.clone(),
            reason,
        };

        let Some(argv) = config.tool.pull_command(config.tool_path.as_deref(), req) else {
            debug!(image = %req.name, tool = %config.tool, "Tool uses no images, nothing to pull");
            return Ok(());
        };
        if req.name.is_empty() {
            return Err(pull_err("empty image reference".to_string()));
        }

        tokio::fs::create_dir_all(&config.image_cache_dir)
            .await
            .map_err(|e| pull_err(format!("creating image cache directory: {e}")))?;

        debug!(image = %req.name, argv = ?argv, "Pulling image");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&config.image_cache_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| pull_err(format!("{}: {e}", argv[0])))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let cached = combined.contains(IMAGE_EXISTS_MARKER);

        for line in combined.lines().filter(|l| !l.trim().is_empty()) {
            let (level, message) = LogLevel::split_prefix(line, LogLevel::Info);
            // An existing image is reported as fatal by the tool, but is fine.
            let level = if cached && message.contains(IMAGE_EXISTS_MARKER) {
                LogLevel::Info
            } else {
                level
            };
            if let Err(e) = publisher
                .publish(Event::log(level, LogStream::Runtime, message))
                .await
            {
                warn!(image = %req.name, error = %e, "Failed to publish pull output");
                break;
            }
        }

        if output.status.success() || cached {
            info!(image = %req.name, cached, "Image available");
            Ok(())
        } else {
            let tail = combined
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| LogLevel::split_prefix(l, LogLevel::Info).1)
                .unwrap_or("no output");
            Err(pull_err(format!("{} ({})", output.status, tail)))
        }
    }
}
