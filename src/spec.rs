//! Run specification types.
//!
//! This module defines what the caller asks the runtime to execute:
//! - `RunSpec`: image, command, environment, ports, devices, archives
//! - `DeviceRequest`: accelerator visibility request
//! - `RunArchive` / `ArchiveItem`: content materialized before execution
//! - `PullRequest`: image pull parameters
//!
//! The runtime only reads these values. Device visibility variables are
//! derived at launch time and never written back.

use crate::constants::MAX_IMAGE_REF_LEN;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Run Specification
// =============================================================================

/// Immutable description of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Image reference (e.g. `docker://ubuntu:22.04`). Ignored by the host tool.
    pub image: String,
    /// Command and arguments.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment as ordered `KEY=VALUE` entries, deduplicated by the caller.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container. Empty means tool default.
    #[serde(default)]
    pub working_dir: String,
    /// Declared exposed ports (`8080/tcp`).
    #[serde(default)]
    pub exposed_ports: BTreeSet<String>,
    /// Accelerator device requests.
    #[serde(default)]
    pub device_requests: Vec<DeviceRequest>,
    /// Content to materialize before execution.
    #[serde(default)]
    pub archives: Vec<RunArchive>,
    /// Free-form labels, used by list filters.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl RunSpec {
    /// Creates a spec for `image` running `cmd`.
    pub fn new(image: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            image: image.into(),
            cmd,
            ..Default::default()
        }
    }

    /// Validates fields every backend relies on.
    ///
    /// Image presence is checked by the tool, since the host tool has none.
    pub fn validate(&self, id: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSpec {
            id: id.to_string(),
            reason,
        };

        if self.cmd.is_empty() || self.cmd[0].is_empty() {
            return Err(invalid("command is empty".to_string()));
        }
        if self.image.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(format!(
                "image reference exceeds {MAX_IMAGE_REF_LEN} bytes"
            )));
        }
        for entry in &self.env {
            match entry.split_once('=') {
                Some((key, _)) if !key.is_empty() => {}
                _ => return Err(invalid(format!("malformed env entry '{entry}'"))),
            }
        }
        if !self.working_dir.is_empty() && !self.working_dir.starts_with('/') {
            return Err(invalid(format!(
                "working directory '{}' is not absolute",
                self.working_dir
            )));
        }
        for port in &self.exposed_ports {
            if parse_port(port).is_none() {
                return Err(invalid(format!("malformed exposed port '{port}'")));
            }
        }
        for archive in &self.archives {
            if !archive.path.starts_with('/') {
                return Err(invalid(format!(
                    "archive destination '{}' is not absolute",
                    archive.path
                )));
            }
        }
        Ok(())
    }

    /// Returns the comma-separated device ids requested for `class`.
    ///
    /// `None` when no request of that class exists. An empty string means
    /// the class was requested without explicit ids.
    pub fn visible_devices(&self, class: DeviceClass) -> Option<String> {
        let mut ids: Option<Vec<&str>> = None;
        for request in &self.device_requests {
            if request.class() == Some(class) {
                ids.get_or_insert_with(Vec::new)
                    .extend(request.device_ids.iter().map(String::as_str));
            }
        }
        ids.map(|ids| ids.join(","))
    }

    /// Returns true if any archive must be materialized.
    pub fn has_archives(&self) -> bool {
        self.archives.iter().any(|a| !a.items.is_empty())
    }

    /// Returns a copy without archive content, for persistence.
    pub fn without_archives(&self) -> Self {
        Self {
            archives: Vec::new(),
            ..self.clone()
        }
    }
}

/// Parses `port[/proto]` into its number and protocol.
fn parse_port(port: &str) -> Option<(u16, &str)> {
    let (number, proto) = port.split_once('/').unwrap_or((port, "tcp"));
    let number = number.parse::<u16>().ok()?;
    matches!(proto, "tcp" | "udp" | "sctp").then_some((number, proto))
}

// =============================================================================
// Devices
// =============================================================================

/// Accelerator vendor class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// NVIDIA GPUs (`CUDA_VISIBLE_DEVICES`).
    Nvidia,
    /// AMD GPUs (`ROCR_VISIBLE_DEVICES`).
    Amd,
}

/// Request for accelerator devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// Driver class name (`nvidia`, `amd`).
    pub driver: String,
    /// Device identifiers (indices or UUIDs).
    #[serde(default)]
    pub device_ids: Vec<String>,
}

impl DeviceRequest {
    /// Creates an NVIDIA request for the given ids.
    pub fn nvidia(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            driver: "nvidia".to_string(),
            device_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the device class, if the driver is known.
    pub fn class(&self) -> Option<DeviceClass> {
        match self.driver.to_ascii_lowercase().as_str() {
            "nvidia" | "cuda" => Some(DeviceClass::Nvidia),
            "amd" | "rocm" => Some(DeviceClass::Amd),
            _ => None,
        }
    }
}

// =============================================================================
// Archives
// =============================================================================

/// A set of items materialized under a destination path in the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArchive {
    /// Absolute destination path inside the container (e.g. `/run/det`).
    pub path: String,
    /// Items relative to `path`.
    #[serde(default)]
    pub items: Vec<ArchiveItem>,
}

/// Kind of an archive item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Regular file; `content` holds the bytes.
    #[default]
    File,
    /// Directory; `content` is ignored.
    Directory,
    /// Symbolic link; `content` holds the target.
    Symlink,
}

/// One file, directory or symlink in an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveItem {
    /// Path relative to the archive destination.
    pub path: String,
    /// Item kind.
    #[serde(default)]
    pub kind: ItemKind,
    /// File content or symlink target.
    #[serde(default)]
    pub content: Vec<u8>,
    /// Permission bits. Zero means `0o644` for files and `0o755` for directories.
    #[serde(default)]
    pub mode: u32,
}

impl ArchiveItem {
    /// Creates a regular file item.
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: ItemKind::File,
            content: content.into(),
            mode,
        }
    }

    /// Creates a directory item.
    pub fn dir(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: ItemKind::Directory,
            content: Vec::new(),
            mode,
        }
    }

    /// Creates a symlink item pointing at `target`.
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ItemKind::Symlink,
            content: target.into().into_bytes(),
            mode: 0,
        }
    }
}

// =============================================================================
// Pull Request
// =============================================================================

/// Image pull parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Image reference.
    pub name: String,
    /// Re-pull even when the image is cached.
    #[serde(default)]
    pub force_pull: bool,
}

impl PullRequest {
    /// Creates a pull request for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            force_pull: false,
        }
    }
}
