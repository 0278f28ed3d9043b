//! Container output pumps.
//!
//! Each running container gets two pump tasks, one per output stream, that
//! split the stream into lines and publish one [`Event::Log`] per line. The
//! tasks live in the runtime's work group and stop when it is cancelled.
//!
//! Levels: stdout lines are `Info`. Stderr lines are `Info` unless they
//! carry an image-tool level prefix (`FATAL:`, `WARNING:`, ...), which is
//! stripped and mapped.
//!
//! A failing publisher never stops a pump. The pump keeps draining so the
//! supervisor's pipe never fills up, and reports the failure once.

use crate::constants::MAX_LOG_LINE_LEN;
use crate::events::{Event, LogLevel, LogStream, Publisher};
use crate::runtime::ContainerId;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Spawns a pump for one output stream into `tracker`.
///
/// The returned handle resolves once the stream reaches end of file.
pub fn spawn_pump<R>(
    tracker: &TaskTracker,
    cancel: CancellationToken,
    id: ContainerId,
    stream: LogStream,
    reader: R,
    publisher: Arc<dyn Publisher>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tracker.spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut publish_failed = false;
        let mut lines = 0u64;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(container = %id, ?stream, "Log pump cancelled");
                    break;
                }
                next = next_line(&mut reader, &mut buf) => next,
            };

            match next {
                Ok(false) => break,
                Ok(true) => {
                    lines += 1;
                    let line = String::from_utf8_lossy(&buf);
                    let (level, message) = classify(stream, &line);
                    if let Err(e) = publisher.publish(Event::log(level, stream, message)).await
                        && !publish_failed
                    {
                        publish_failed = true;
                        warn!(
                            container = %id,
                            ?stream,
                            error = %e,
                            "Failed to publish container output, continuing to drain"
                        );
                    }
                }
                Err(e) => {
                    warn!(container = %id, ?stream, error = %e, "Failed to read container output");
                    break;
                }
            }
        }

        debug!(container = %id, ?stream, lines, "Log pump finished");
    })
}

fn classify(stream: LogStream, line: &str) -> (LogLevel, &str) {
    match stream {
        LogStream::Stderr | LogStream::Runtime => LogLevel::split_prefix(line, LogLevel::Info),
        LogStream::Stdout => (LogLevel::Info, line),
    }
}

/// Reads one line into `buf`, without the terminator.
///
/// Lines longer than [`MAX_LOG_LINE_LEN`] are returned in pieces. Returns
/// `Ok(false)` at end of stream.
pub(crate) async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(!buf.is_empty());
        }

        let room = MAX_LOG_LINE_LEN - buf.len();
        let window = &available[..available.len().min(room)];
        if let Some(pos) = window.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&window[..pos]);
            reader.consume(pos + 1);
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(true);
        }

        let taken = window.len();
        buf.extend_from_slice(window);
        reader.consume(taken);
        if buf.len() >= MAX_LOG_LINE_LEN {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelPublisher;

    #[tokio::test]
    async fn test_next_line_splits_and_trims() {
        let data: &[u8] = b"first\r\nsecond\nlast";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert!(next_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"first");
        assert!(next_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"second");
        assert!(next_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"last");
        assert!(!next_line(&mut reader, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn test_next_line_caps_long_lines() {
        let mut data = vec![b'x'; MAX_LOG_LINE_LEN + 10];
        data.push(b'\n');
        let mut reader = BufReader::new(data.as_slice());
        let mut buf = Vec::new();

        assert!(next_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf.len(), MAX_LOG_LINE_LEN);
        assert!(next_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf.len(), 10);
        assert!(!next_line(&mut reader, &mut buf).await.unwrap());
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(LogStream::Stderr, "FATAL:   no such image"),
            (LogLevel::Critical, "no such image")
        );
        assert_eq!(
            classify(LogStream::Stdout, "ERROR: from the workload"),
            (LogLevel::Info, "ERROR: from the workload")
        );
    }

    #[tokio::test]
    async fn test_pump_publishes_lines_in_order() {
        let tracker = TaskTracker::new();
        let (publisher, mut rx) = ChannelPublisher::channel(16);
        let data: &'static [u8] = b"one\ntwo\nWARNING: three\n";

        let pump = spawn_pump(
            &tracker,
            CancellationToken::new(),
            ContainerId::from("c1"),
            LogStream::Stderr,
            data,
            Arc::new(publisher),
        );
        pump.await.unwrap();

        let mut got = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Log { level, message, .. } = event {
                got.push((level, message));
            }
        }
        assert_eq!(
            got,
            vec![
                (LogLevel::Info, "one".to_string()),
                (LogLevel::Info, "two".to_string()),
                (LogLevel::Warning, "three".to_string()),
            ]
        );
    }
}
