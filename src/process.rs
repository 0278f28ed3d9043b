//! OS process primitives for process-backed containers.
//!
//! A container's live handle does not survive an agent restart. What does
//! survive is a [`ProcessIdentity`]: the pid plus the kernel start time of
//! the process, which together detect pid reuse when revalidating.
//!
//! The supervisor shim records how the workload ended in an [`ExitRecord`]
//! so the status can be recovered by a runtime that is not the parent.

use crate::runtime::ExitOutcome;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use tracing::warn;

// =============================================================================
// Process Identity
// =============================================================================

/// Durable reference to a process: pid plus start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: i32,
    /// Start time in clock ticks since boot (`/proc/<pid>/stat` field 22).
    /// `None` where procfs is unavailable.
    #[serde(default)]
    pub start_time: Option<u64>,
}

impl ProcessIdentity {
    /// Captures the identity of a running process.
    pub fn capture(pid: i32) -> Self {
        Self {
            pid,
            start_time: read_stat(pid).map(|s| s.start_time),
        }
    }

    /// Returns true if the pid refers to a live, non-zombie process that
    /// started at the recorded time.
    pub fn is_alive(&self) -> bool {
        if self.pid <= 0 {
            return false;
        }
        // SAFETY: kill with signal 0 performs only the existence check.
        let ret = unsafe { libc::kill(self.pid, 0) };
        if ret != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
            return false;
        }
        if !cfg!(target_os = "linux") {
            return true;
        }
        match read_stat(self.pid) {
            Some(stat) => {
                stat.state != 'Z' && self.start_time.is_none_or(|t| t == stat.start_time)
            }
            None => false,
        }
    }

    /// Sends `signal` to the process group led by this process.
    ///
    /// Returns an `ErrorKind::NotFound` error when the group no longer exists.
    pub fn signal_group(&self, signal: i32) -> io::Result<()> {
        if self.pid <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
        }
        // SAFETY: killpg has no memory-safety preconditions.
        let ret = unsafe { libc::killpg(self.pid, signal) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(io::Error::new(io::ErrorKind::NotFound, err));
        }
        Err(err)
    }
}

/// Fields of `/proc/<pid>/stat` used for revalidation.
struct ProcStat {
    state: char,
    start_time: u64,
}

#[cfg(target_os = "linux")]
fn read_stat(pid: i32) -> Option<ProcStat> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_stat(_pid: i32) -> Option<ProcStat> {
    None
}

/// Parses a stat line. The command name (field 2) may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); field 22 (starttime) is fields[19].
    let state = fields.first()?.chars().next()?;
    let start_time = fields.get(19)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

// =============================================================================
// Start Handshake
// =============================================================================

/// Creates the pipe the shim reports the workload start on.
///
/// Returns `(read, write)`. Both ends are close-on-exec; the spawner clears
/// the flag on the write end in the child only.
pub fn status_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];
    // SAFETY: pipe2 writes two descriptors into the array on success.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

// =============================================================================
// Exit Status
// =============================================================================

/// How a supervised workload ended, written by the shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// Exit code, for a normal exit.
    pub status_code: Option<i32>,
    /// Terminating signal, for an abnormal exit.
    pub signal: Option<i32>,
}

impl ExitRecord {
    /// Builds a record from a wait status.
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            status_code: status.code(),
            signal: status.signal(),
        }
    }

    /// Reads a record, returning `None` if absent or unreadable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read exit record");
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed exit record");
                None
            }
        }
    }

    /// Writes the record via a temp file and rename.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec(self).map_err(io::Error::other)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)
    }

    /// Converts to the caller-facing outcome.
    pub fn outcome(&self) -> ExitOutcome {
        match (self.status_code, self.signal) {
            (Some(code), _) => ExitOutcome::exited(i64::from(code)),
            (None, Some(sig)) => signal_outcome(sig),
            (None, None) => unknown_outcome("process ended without status"),
        }
    }
}

/// Outcome for a process terminated by `sig`.
pub fn signal_outcome(sig: i32) -> ExitOutcome {
    ExitOutcome::abnormal(
        128 + i64::from(sig),
        format!("terminated by signal {sig} ({})", signal_name(sig)),
    )
}

/// Outcome for a process whose status could not be observed.
pub fn unknown_outcome(reason: &str) -> ExitOutcome {
    ExitOutcome::abnormal(-1, format!("exit status unknown: {reason}"))
}

/// Returns the conventional name of common signals.
pub fn signal_name(sig: i32) -> &'static str {
    match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        _ => "unknown",
    }
}
