//! procrun-shim - per-container supervisor.
//!
//! ```sh
//! procrun-shim --exit-file <path> [--status-fd <fd>] -- <command> [args...]
//! ```
//!
//! Started by the process runtime as the leader of a new session. See
//! [`procrun::shim`] for what it does.

use procrun::shim::{self, ShimArgs};
use std::process::ExitCode;

/// Exit code for shim usage or setup errors, and for a workload that
/// could not be started.
const SHIM_ERROR_CODE: u8 = 125;

fn main() -> ExitCode {
    let args = match ShimArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("procrun-shim: {e}");
            eprintln!("usage: procrun-shim --exit-file <path> [--status-fd <fd>] -- <command> [args...]");
            return ExitCode::from(SHIM_ERROR_CODE);
        }
    };

    if let Err(e) = shim::install_signal_handlers() {
        eprintln!("procrun-shim: installing signal handlers: {e}");
        return ExitCode::from(SHIM_ERROR_CODE);
    }

    match shim::supervise(&args) {
        Ok(record) => shim::exit_like(&record),
        Err(e) => {
            eprintln!("procrun-shim: {e}");
            ExitCode::from(SHIM_ERROR_CODE)
        }
    }
}
