//! # Runtime Constants
//!
//! Paths, timeouts, limits and environment variable names shared by the
//! runtime backends, the supervisor shim and the CLI.
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Uses the path defaults
//! - [`crate::runtimes::tool`]: Uses the in-container paths and env names
//! - [`crate::runtimes::process`]: Uses the limits and poll intervals
//! - [`crate::shim`]: Uses the exit-record file name

use std::time::Duration;

// =============================================================================
// Limits
// =============================================================================

/// Maximum number of container records per runtime instance.
///
/// Bounds registry and state-file growth. Create fails with
/// `ResourceExhausted` once reached.
pub const MAX_CONTAINERS: usize = 1024;

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum combined size of archive content staged for one container (1 GiB).
pub const MAX_STAGED_BYTES: u64 = 1024 * 1024 * 1024;

/// Maximum size of a YAML configuration document (64 KiB).
pub const MAX_CONFIG_SIZE: usize = 64 * 1024;

/// Maximum length of a single log line before it is split (64 KiB).
///
/// Longer lines are emitted as several log events.
pub const MAX_LOG_LINE_LEN: usize = 64 * 1024;

// =============================================================================
// Timeouts
// =============================================================================
//
// The runtime imposes no deadline on workloads themselves. These bound only
// the plumbing around them.
// =============================================================================

/// How long a publish may wait on a full event channel (5 seconds).
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval used to observe the exit of a reattached process.
///
/// A reattached process is not our child, so it cannot be waited on.
pub const REATTACH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long the shim keeps relaying output after the workload exits.
///
/// Background processes of the workload may hold the pipes open forever.
pub const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Storage Paths
// =============================================================================

/// Default state file when running as root.
pub const SYSTEM_STATE_FILE: &str = "/var/cache/procrun/containers.json";

/// Default staging root when running as root.
pub const SYSTEM_STAGING_ROOT: &str = "/var/tmp/procrun";

/// Default image cache directory when running as root.
pub const SYSTEM_IMAGE_CACHE_DIR: &str = "/var/cache/procrun/images";

/// Directory under the user's home used when not running as root.
pub const USER_BASE_DIR: &str = ".procrun";

/// State file name within a base directory.
pub const STATE_FILE_NAME: &str = "containers.json";

/// Subdirectory of a container's staging directory holding archive content.
pub const STAGE_SUBDIR: &str = "stage";

/// File in a container's staging directory where the shim records the exit.
pub const EXIT_RECORD_FILE: &str = "exit.json";

// =============================================================================
// In-Container Layout
// =============================================================================

/// Well-known container path the stage directory is bound to.
///
/// The only bind mount added by the runtime. A bootstrap step inside the
/// container copies its content to the final destinations.
pub const CONTAINER_STAGE_PATH: &str = "/run/procrun/stage";

/// `$0` of the in-container bootstrap shell, visible in `ps` output.
pub const BOOTSTRAP_ARGV0: &str = "procrun-bootstrap";

/// Network mode reported for process-backed containers.
pub const HOST_NETWORK_MODE: &str = "host";

// =============================================================================
// Environment Variables
// =============================================================================

/// Points host-tool workloads at their stage directory.
pub const STAGING_DIR_ENV: &str = "PROCRUN_STAGING_DIR";

/// NVIDIA device visibility variable.
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// AMD device visibility variable.
pub const ROCR_VISIBLE_DEVICES: &str = "ROCR_VISIBLE_DEVICES";

/// Name of the shim binary.
pub const SHIM_BINARY: &str = "procrun-shim";

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for container IDs.
///
/// Excludes `/` and `.` since IDs are used in staging directory names.
pub const CONTAINER_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID for safety.
///
/// Container IDs must be non-empty, at most [`MAX_CONTAINER_ID_LEN`] bytes
/// and only contain characters from [`CONTAINER_ID_VALID_CHARS`].
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_ID_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
