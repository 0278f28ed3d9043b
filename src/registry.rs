//! # Container Registry
//!
//! The single source of truth for which containers a runtime instance knows
//! about. A mutex-guarded map from [`ContainerId`] to [`ContainerRecord`].
//!
//! ## Locking
//!
//! Every method takes the lock for one map operation and releases it before
//! returning. Nothing here spawns, waits or performs I/O, so callers never
//! hold the lock across a blocking call.
//!
//! ## Generations
//!
//! Each insert stamps the record with a fresh generation. Background tasks
//! remember the generation they were started for and only delete a record
//! whose generation still matches, so a container that was removed and
//! created again under the same id is never removed by the first
//! process's exit.
//!
//! ## Versions
//!
//! Every mutation bumps a version counter. [`ContainerRegistry::snapshot`]
//! returns the version alongside the data so the state store can discard
//! out-of-order writes.

use crate::constants::MAX_CONTAINERS;
use crate::error::{Error, Result};
use crate::process::ProcessIdentity;
use crate::runtime::{ContainerId, ContainerSummary, ListFilter};
use crate::runtimes::LaunchPlan;
use crate::spec::RunSpec;
use crate::staging::StagingDir;
use crate::storage::{PersistedRecord, StateSnapshot};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Where a record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Prepared, no process yet.
    Created,
    /// Process running and watched by this runtime instance.
    Running,
    /// Loaded from a snapshot with a live process, not yet reattached.
    Restored,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Restored => write!(f, "restored"),
        }
    }
}

/// One container known to the runtime.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    /// Derived launch recipe.
    pub launch: LaunchPlan,
    /// Run specification as given to create.
    pub spec: RunSpec,
    pub network_mode: String,
    pub ports: BTreeSet<String>,
    /// Staging directory, owned by this record.
    pub staging: StagingDir,
    /// Process reference, set once run.
    pub process: Option<ProcessIdentity>,
    pub state: RecordState,
    /// Assigned by the registry on insert.
    pub generation: u64,
}

impl ContainerRecord {
    /// Creates a record in the `Created` state.
    pub fn created(
        launch: LaunchPlan,
        spec: RunSpec,
        network_mode: String,
        staging: StagingDir,
    ) -> Self {
        let ports = spec.exposed_ports.clone();
        Self {
            launch,
            spec,
            network_mode,
            ports,
            staging,
            process: None,
            state: RecordState::Created,
            generation: 0,
        }
    }

    /// Rebuilds a record from persisted state.
    pub fn restored(persisted: PersistedRecord) -> Self {
        let process = persisted.process();
        Self {
            launch: persisted.launch,
            spec: persisted.spec,
            network_mode: persisted.network_mode,
            ports: persisted.ports,
            staging: StagingDir::open(persisted.staging_dir),
            state: if process.is_some() {
                RecordState::Restored
            } else {
                RecordState::Created
            },
            process,
            generation: 0,
        }
    }

    /// Returns the durable part of the record.
    pub fn persisted(&self) -> PersistedRecord {
        PersistedRecord {
            pid: self.process.map(|p| p.pid),
            start_time: self.process.and_then(|p| p.start_time),
            launch: self.launch.clone(),
            spec: self.spec.without_archives(),
            network_mode: self.network_mode.clone(),
            ports: self.ports.clone(),
            staging_dir: self.staging.path().to_path_buf(),
        }
    }

    fn summary(&self, id: &ContainerId, pid: i32) -> ContainerSummary {
        ContainerSummary {
            id: id.clone(),
            pid,
            image: self.spec.image.clone(),
            command: self.spec.cmd.clone(),
            labels: self.spec.labels.clone(),
            network_mode: self.network_mode.clone(),
            ports: self.ports.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<ContainerId, ContainerRecord>,
    next_generation: u64,
    version: u64,
}

/// Mutex-guarded map of container records.
///
/// Owned by one runtime instance; there is no process-wide registry.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    inner: Mutex<Inner>,
}

impl ContainerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    /// Inserts `record`, replacing any record with the same identity.
    ///
    /// Returns the new generation and the replaced record.
    pub fn insert(
        &self,
        id: ContainerId,
        record: ContainerRecord,
    ) -> Result<(u64, Option<ContainerRecord>)> {
        let mut inner = self.lock()?;
        Self::insert_locked(&mut inner, id, record)
    }

    /// Like [`insert`](Self::insert), but only replaces a record that has not
    /// been started.
    ///
    /// A running or restored record keeps its place and the call fails with
    /// [`Error::InvalidState`]; it has to be removed first.
    pub fn insert_replacing_created(
        &self,
        id: ContainerId,
        record: ContainerRecord,
    ) -> Result<(u64, Option<ContainerRecord>)> {
        let mut inner = self.lock()?;
        if let Some(old) = inner.records.get(&id)
            && old.state != RecordState::Created
        {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: old.state.to_string(),
                expected: RecordState::Created.to_string(),
            });
        }
        Self::insert_locked(&mut inner, id, record)
    }

    fn insert_locked(
        inner: &mut Inner,
        id: ContainerId,
        mut record: ContainerRecord,
    ) -> Result<(u64, Option<ContainerRecord>)> {
        if !inner.records.contains_key(&id) && inner.records.len() >= MAX_CONTAINERS {
            return Err(Error::ResourceExhausted(format!(
                "maximum container limit reached ({MAX_CONTAINERS})"
            )));
        }
        inner.next_generation += 1;
        inner.version += 1;
        record.generation = inner.next_generation;
        let generation = record.generation;
        let replaced = inner.records.insert(id, record);
        Ok((generation, replaced))
    }

    /// Reads a record.
    pub fn get(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        Ok(self.lock()?.records.get(id).cloned())
    }

    /// Mutates a record in place. Returns `None` if absent.
    pub fn update<R>(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut ContainerRecord) -> R,
    ) -> Result<Option<R>> {
        let mut inner = self.lock()?;
        let Some(record) = inner.records.get_mut(id) else {
            return Ok(None);
        };
        let out = f(record);
        inner.version += 1;
        Ok(Some(out))
    }

    /// Removes a record unconditionally.
    pub fn remove(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        let mut inner = self.lock()?;
        let removed = inner.records.remove(id);
        if removed.is_some() {
            inner.version += 1;
        }
        Ok(removed)
    }

    /// Removes a record only if it still has `generation`.
    pub fn remove_generation(
        &self,
        id: &ContainerId,
        generation: u64,
    ) -> Result<Option<ContainerRecord>> {
        let mut inner = self.lock()?;
        if inner.records.get(id).is_none_or(|r| r.generation != generation) {
            return Ok(None);
        }
        inner.version += 1;
        Ok(inner.records.remove(id))
    }

    /// Returns true if a record exists.
    pub fn contains(&self, id: &ContainerId) -> Result<bool> {
        Ok(self.lock()?.records.contains_key(id))
    }

    /// Number of records.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }

    /// Returns true if there are no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Lists records with a process that match `filter`.
    pub fn running(&self, filter: &ListFilter) -> Result<HashMap<ContainerId, ContainerSummary>> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .filter(|(id, record)| filter.matches(id, &record.spec.labels))
            .filter_map(|(id, record)| {
                record
                    .process
                    .map(|p| (id.clone(), record.summary(id, p.pid)))
            })
            .collect())
    }

    /// Takes a point-in-time copy of all records for persistence.
    pub fn snapshot(&self) -> Result<(u64, StateSnapshot)> {
        let inner = self.lock()?;
        let snapshot = inner
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.persisted()))
            .collect();
        Ok((inner.version, snapshot))
    }
}
