//! # Persisted Container State
//!
//! The registry is snapshotted to a single JSON file so a restarted agent
//! can find the containers it started.
//!
//! ## Format
//!
//! ```json
//! {
//!   "trial-7-rank-0": {
//!     "pid": 41235,
//!     "start_time": 998877,
//!     "cmd": ["singularity", "run", "--writable-tmpfs", "...", "docker://...", "python3"],
//!     "launch_env": [["SINGULARITYENV_CUDA_VISIBLE_DEVICES", "0"]],
//!     "spec": { "image": "docker://...", "cmd": ["..."] },
//!     "network_mode": "host",
//!     "ports": ["1734/tcp"],
//!     "staging_dir": "/var/tmp/procrun/trial-7-rank-0-1a2b3c4d"
//!   }
//! }
//! ```
//!
//! ## Atomic Writes
//!
//! Snapshots are written to `<file>.tmp`, synced, then renamed over the
//! state file, so a crash leaves either the old or the new snapshot.
//!
//! ## Ordering
//!
//! Each snapshot carries the registry version it was taken at. Writes of a
//! version older than the last written one are skipped, so concurrent
//! savers never regress the file.

use crate::error::{Error, Result};
use crate::process::ProcessIdentity;
use crate::runtime::ContainerId;
use crate::runtimes::LaunchPlan;
use crate::spec::RunSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// The durable part of a container record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Process id, once the container has been run.
    #[serde(default)]
    pub pid: Option<i32>,
    /// Process start time, for pid-reuse detection.
    #[serde(default)]
    pub start_time: Option<u64>,
    /// Derived launch recipe (`cmd`, `launch_env`, `current_dir`).
    #[serde(flatten)]
    pub launch: LaunchPlan,
    /// Run specification, without archive content.
    pub spec: RunSpec,
    pub network_mode: String,
    #[serde(default)]
    pub ports: BTreeSet<String>,
    pub staging_dir: PathBuf,
}

impl PersistedRecord {
    /// Returns the process identity, if the container was run.
    pub fn process(&self) -> Option<ProcessIdentity> {
        self.pid.map(|pid| ProcessIdentity {
            pid,
            start_time: self.start_time,
        })
    }
}

/// Snapshot contents: identity to record.
pub type StateSnapshot = BTreeMap<ContainerId, PersistedRecord>;

/// State file reader/writer.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    last_version: Mutex<Option<u64>>,
}

impl StateStore {
    /// Creates a store for `path`. Nothing is touched until load or save.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_version: Mutex::new(None),
        }
    }

    /// Returns the state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Reads the state file. A missing file is an empty snapshot.
    pub fn load(&self) -> Result<StateSnapshot> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(StateSnapshot::new());
            }
            Err(e) => {
                return Err(Error::StateFailed {
                    path: self.path.clone(),
                    reason: format!("opening state file: {e}"),
                });
            }
        };

        let snapshot: StateSnapshot =
            serde_json::from_slice(&content).map_err(|e| Error::StateFailed {
                path: self.path.clone(),
                reason: format!("decoding state file: {e}"),
            })?;
        info!(
            path = %self.path.display(),
            containers = snapshot.len(),
            "Loaded container state"
        );
        Ok(snapshot)
    }

    /// Writes `snapshot`, taken at registry `version`, atomically.
    ///
    /// Returns `Ok(false)` if a newer version was already written.
    pub fn save(&self, version: u64, snapshot: &StateSnapshot) -> Result<bool> {
        let mut last = self
            .last_version
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        if last.is_some_and(|v| v >= version) {
            return Ok(false);
        }

        let state_err = |reason: String| Error::StateFailed {
            path: self.path.clone(),
            reason,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| state_err(format!("creating state directory: {e}")))?;
        }

        let content = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.tmp_path();
        let mut file =
            fs::File::create(&tmp).map_err(|e| state_err(format!("opening state copy: {e}")))?;
        file.write_all(&content)
            .and_then(|()| file.sync_all())
            .map_err(|e| state_err(format!("writing state copy: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| state_err(format!("committing state file: {e}")))?;

        *last = Some(version);
        debug!(
            path = %self.path.display(),
            version,
            containers = snapshot.len(),
            "Persisted container state"
        );
        Ok(true)
    }
}
