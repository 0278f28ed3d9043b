//! Shared helpers for integration tests.
//!
//! Real processes are launched with the host tool through the
//! `procrun-shim` binary built alongside the tests.

#![allow(dead_code)]

use procrun::events::{ChannelPublisher, DiscardPublisher};
use procrun::{Completion, Config, ContainerWaiter, Event, ImageTool, LogStream, Publisher, RunSpec};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound on any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Host-tool config rooted in `dir`.
pub fn host_config(dir: &Path) -> Config {
    Config::default()
        .rooted_at(dir)
        .with_tool(ImageTool::Host)
        .with_shim_path(env!("CARGO_BIN_EXE_procrun-shim"))
}

/// Spec running `script` with `sh -c`.
pub fn sh(script: &str) -> RunSpec {
    RunSpec::new("", vec!["sh".into(), "-c".into(), script.into()])
}

pub fn discard() -> Arc<dyn Publisher> {
    Arc::new(DiscardPublisher)
}

pub fn channel() -> (Arc<dyn Publisher>, mpsc::Receiver<Event>) {
    let (publisher, rx) = ChannelPublisher::channel(1024);
    (Arc::new(publisher), rx)
}

/// Waits for a completion, failing the test on timeout.
pub async fn wait(waiter: ContainerWaiter) -> Completion {
    tokio::time::timeout(TEST_TIMEOUT, waiter.wait())
        .await
        .expect("container did not finish in time")
        .expect("waiter detached")
}

/// Receives events until a log line equal to `line` arrives.
pub async fn wait_for_line(rx: &mut mpsc::Receiver<Event>, line: &str) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            if event.message() == Some(line) {
                return;
            }
        }
        panic!("event channel closed before '{line}'");
    })
    .await
    .expect("line did not arrive in time");
}

/// Drains buffered log messages for `stream`.
pub fn drain_lines(rx: &mut mpsc::Receiver<Event>, stream: LogStream) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Log {
            stream: s, message, ..
        } = event
            && s == stream
        {
            lines.push(message);
        }
    }
    lines
}
