//! # Supervisor Shim
//!
//! Every process-backed container is launched through `procrun-shim`:
//!
//! ```text
//! procrun-shim --exit-file <staging>/exit.json [--status-fd <fd>] -- <tool> run ... <cmd...>
//! ```
//!
//! The shim is the session and process group leader. It forwards nothing
//! itself: group-directed signals reach the workload directly, so the shim
//! only needs to survive them. Its jobs are:
//!
//! 1. Relay the workload's stdout/stderr to its own. If the agent side of
//!    the pipes goes away, keep reading and discard, so the workload never
//!    blocks on a full pipe or dies of `SIGPIPE`.
//! 2. Record how the workload ended in an [`ExitRecord`], which a runtime
//!    that reattached after a restart (and so is not the parent) can read.
//! 3. Exit the same way the workload did: same code, or the same signal.
//!
//! ## Start Handshake
//!
//! With `--status-fd`, the shim writes one line to that descriptor as soon
//! as it knows whether the workload started, then closes it:
//!
//! ```text
//! started
//! failed: <program>: <error>
//! ```
//!
//! The runtime blocks `run_container` on this line, so an exec failure is
//! reported to the caller instead of showing up later as an exit code. A
//! workload that never started gets no exit record. The descriptor is
//! close-on-exec in the shim, so the workload never holds it open.
//!
//! The shim does not use tracing. Its stderr is the container's stderr, so
//! the few diagnostics it prints end up in the container log.

use crate::constants::RELAY_DRAIN_TIMEOUT;
use crate::process::ExitRecord;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Instant;

/// Signals the shim survives so they only affect the workload.
const SURVIVED_SIGNALS: &[libc::c_int] = &[
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// Status line reporting that the workload started.
pub const STATUS_STARTED: &str = "started";

/// Prefix of the status line reporting that the workload could not start.
pub const STATUS_FAILED: &str = "failed: ";

/// Parsed shim command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimArgs {
    /// Where to write the exit record.
    pub exit_file: PathBuf,
    /// Inherited descriptor to report the workload start on.
    pub status_fd: Option<RawFd>,
    /// Workload command line.
    pub argv: Vec<String>,
}

impl ShimArgs {
    /// Parses `--exit-file <path> [--status-fd <fd>] -- <argv...>` (program
    /// name excluded).
    pub fn parse<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let mut exit_file = None;
        let mut status_fd = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--exit-file" => {
                    exit_file = Some(PathBuf::from(
                        args.next().ok_or("--exit-file requires a path")?,
                    ));
                }
                "--status-fd" => {
                    let fd = args.next().ok_or("--status-fd requires a descriptor")?;
                    let fd = fd
                        .parse::<RawFd>()
                        .ok()
                        .filter(|fd| *fd > 2)
                        .ok_or_else(|| format!("invalid --status-fd '{fd}'"))?;
                    status_fd = Some(fd);
                }
                "--" => break,
                other => return Err(format!("unexpected argument '{other}'")),
            }
        }

        let exit_file = exit_file.ok_or("missing --exit-file")?;
        let argv: Vec<String> = args.collect();
        if argv.is_empty() {
            return Err("missing workload command after --".to_string());
        }
        Ok(Self {
            exit_file,
            status_fd,
            argv,
        })
    }

    /// Builds the shim command line for `shim` supervising `argv`.
    pub fn to_command_line(&self, shim: &str) -> Vec<String> {
        let mut line = vec![
            shim.to_string(),
            "--exit-file".to_string(),
            self.exit_file.display().to_string(),
        ];
        if let Some(fd) = self.status_fd {
            line.push("--status-fd".to_string());
            line.push(fd.to_string());
        }
        line.push("--".to_string());
        line.extend(self.argv.iter().cloned());
        line
    }
}

extern "C" fn survive_signal(_: libc::c_int) {}

/// Installs no-op handlers for [`SURVIVED_SIGNALS`].
///
/// Handlers (unlike `SIG_IGN`) are reset to the default on exec, so the
/// workload starts with normal dispositions.
pub fn install_signal_handlers() -> io::Result<()> {
    for &sig in SURVIVED_SIGNALS {
        // SAFETY: zeroed sigaction is valid; the handler is async-signal-safe
        // because it does nothing.
        let ret = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = survive_signal as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, std::ptr::null_mut())
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Runs the workload to completion and writes its exit record.
///
/// Fails without an exit record if the workload cannot be started; the
/// failure is reported on the status descriptor first.
pub fn supervise(args: &ShimArgs) -> io::Result<ExitRecord> {
    let status = args.status_fd.map(take_status_fd).transpose()?;

    let spawned = Command::new(&args.argv[0])
        .args(&args.argv[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    if let Some(mut status) = status {
        let line = match &spawned {
            Ok(_) => STATUS_STARTED.to_string(),
            Err(e) => format!("{STATUS_FAILED}{}: {e}", args.argv[0]),
        };
        // The runtime may have given up waiting; the workload runs anyway.
        if let Err(e) = writeln!(status, "{line}") {
            eprintln!("procrun-shim: reporting start status: {e}");
        }
    }

    let mut child = spawned.map_err(|e| {
        io::Error::new(e.kind(), format!("failed to start '{}': {e}", args.argv[0]))
    })?;

    let (done_tx, done_rx) = mpsc::channel();
    let mut relays = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_relay(stdout, io::stdout(), done_tx.clone());
        relays += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_relay(stderr, io::stderr(), done_tx.clone());
        relays += 1;
    }
    drop(done_tx);

    let status = child.wait()?;
    let deadline = Instant::now() + RELAY_DRAIN_TIMEOUT;
    for _ in 0..relays {
        let left = deadline.saturating_duration_since(Instant::now());
        if done_rx.recv_timeout(left).is_err() {
            break;
        }
    }

    let record = ExitRecord::from_status(status);
    record.write(&args.exit_file)?;
    Ok(record)
}

/// Takes ownership of the inherited status descriptor and marks it
/// close-on-exec.
fn take_status_fd(fd: RawFd) -> io::Result<File> {
    // SAFETY: fcntl on an arbitrary descriptor number only fails with EBADF.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("status descriptor {fd}: {}", io::Error::last_os_error()),
        ));
    }
    // SAFETY: the descriptor is open (checked above) and was inherited for
    // the shim alone, so nothing else in this process owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Interprets the status line read from the shim's status descriptor.
///
/// An empty report means the shim exited before it got to start anything.
pub fn parse_status(report: &str) -> Result<(), String> {
    let line = report.lines().next().unwrap_or("").trim();
    if line == STATUS_STARTED {
        return Ok(());
    }
    if let Some(reason) = line.strip_prefix(STATUS_FAILED) {
        return Err(reason.to_string());
    }
    if line.is_empty() {
        return Err("supervisor exited before starting the workload".to_string());
    }
    Err(format!("unexpected supervisor status '{line}'"))
}

/// Copies `from` to `to` until end of stream, then reports on `done`.
fn spawn_relay<R, W>(mut from: R, mut to: W, done: mpsc::Sender<()>)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut sink_open = true;
        loop {
            match from.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if sink_open && to.write_all(&buf[..n]).and_then(|()| to.flush()).is_err() {
                        // Agent went away. Keep draining.
                        sink_open = false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        let _ = done.send(());
    });
}

/// Terminates the shim the same way the workload terminated.
pub fn exit_like(record: &ExitRecord) -> ! {
    if let Some(sig) = record.signal {
        // SAFETY: restoring the default disposition and raising a signal on
        // ourselves has no memory-safety preconditions.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
        // Signals whose default action is to ignore land here.
        std::process::exit(128 + sig);
    }
    std::process::exit(record.status_code.unwrap_or(1))
}
