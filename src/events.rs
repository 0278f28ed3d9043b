//! Lifecycle and log events.
//!
//! Runtimes report image-pull progress and container output through a
//! [`Publisher`]. Publishing is best effort once a workload runs: failures
//! are logged by the caller and never abort the container.

use crate::constants::PUBLISH_TIMEOUT;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Event Types
// =============================================================================

/// Kind of a timed stats span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    /// Image pull duration.
    ImagePull,
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Splits a tool-style level prefix (`FATAL:   msg`) off a line.
    ///
    /// Returns the detected level and the remaining text, or `default` and
    /// the untouched line when no prefix is present.
    pub fn split_prefix(line: &str, default: LogLevel) -> (LogLevel, &str) {
        const PREFIXES: &[(&str, LogLevel)] = &[
            ("FATAL:", LogLevel::Critical),
            ("ERROR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warning),
            ("INFO:", LogLevel::Info),
            ("VERBOSE:", LogLevel::Debug),
            ("DEBUG:", LogLevel::Debug),
        ];
        for (prefix, level) in PREFIXES {
            if let Some(rest) = line.strip_prefix(prefix) {
                return (*level, rest.trim_start());
            }
        }
        (default, line)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "TRACE"),
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Produced by the runtime itself (e.g. pull output).
    Runtime,
}

/// An event emitted by a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A stats span began.
    BeginStats {
        kind: StatsKind,
        timestamp: DateTime<Utc>,
    },
    /// A stats span ended.
    EndStats {
        kind: StatsKind,
        timestamp: DateTime<Utc>,
    },
    /// One line of output.
    Log {
        level: LogLevel,
        stream: LogStream,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn begin_stats(kind: StatsKind) -> Self {
        Self::BeginStats {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn end_stats(kind: StatsKind) -> Self {
        Self::EndStats {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn log(level: LogLevel, stream: LogStream, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            stream,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Returns the log message, if this is a log event.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Log { message, .. } => Some(message),
            _ => None,
        }
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Ordered sink for runtime events.
///
/// Implementations must be safe to call from concurrent tasks and must not
/// block indefinitely.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one event.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Publisher backed by a bounded tokio channel.
///
/// A full channel back-pressures the sender for at most the configured
/// timeout, after which the event is rejected.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Event>,
    timeout: Duration,
}

impl ChannelPublisher {
    /// Wraps `tx` with the default publish timeout.
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self::with_timeout(tx, PUBLISH_TIMEOUT)
    }

    /// Wraps `tx` with a custom publish timeout.
    pub fn with_timeout(tx: mpsc::Sender<Event>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    /// Creates a publisher and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send_timeout(event, self.timeout)
            .await
            .map_err(|e| Error::PublishFailed(e.to_string()))
    }
}

/// Publisher that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardPublisher;

#[async_trait]
impl Publisher for DiscardPublisher {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}
