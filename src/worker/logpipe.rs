//! Per-invocation log pipe and streaming relay.
//!
//! The task function writes through [`TaskLogger`], which feeds a bounded
//! channel. One relay task per invocation drains the channel, opens the
//! `AppendTaskLog` stream on first use, and sends each line followed by a
//! wait for its ack - so lines are delivered in enqueue order.
//!
//! Closure protocol: the channel closes when every logger handle is
//! dropped; the relay exits only after attempting each enqueued line once.
//! A stream failure aborts the relay and the remaining buffered lines are
//! lost - this is a best-effort log channel, not guaranteed delivery.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::sink::{DispatchSink, LogStream};

/// Buffered lines before the producer blocks.
pub const LOG_BUFFER: usize = 128;

/// Severity prefix attached to each line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// A single severity-tagged log line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub content: String,
}

impl LogLine {
    /// Wire form, e.g. `[INFO] fetched 3 rows`.
    pub fn render(&self) -> String {
        format!("[{}] {}", self.level.as_str(), self.content)
    }
}

/// Logger facade handed to the task function. Cloning shares the same pipe.
#[derive(Clone)]
pub struct TaskLogger {
    tx: mpsc::Sender<LogLine>,
}

impl TaskLogger {
    pub fn new(tx: mpsc::Sender<LogLine>) -> Self {
        Self { tx }
    }

    async fn log(&self, level: LogLevel, content: impl Into<String>) {
        let line = LogLine {
            level,
            content: content.into(),
        };
        // A closed channel means the relay already gave up on this
        // invocation; the line has nowhere to go.
        let _ = self.tx.send(line).await;
    }

    pub async fn debug(&self, content: impl Into<String>) {
        self.log(LogLevel::Debug, content).await;
    }

    pub async fn info(&self, content: impl Into<String>) {
        self.log(LogLevel::Info, content).await;
    }

    pub async fn warning(&self, content: impl Into<String>) {
        self.log(LogLevel::Warning, content).await;
    }

    pub async fn error(&self, content: impl Into<String>) {
        self.log(LogLevel::Error, content).await;
    }
}

/// Create the pipe for one invocation.
pub fn log_pipe() -> (TaskLogger, mpsc::Receiver<LogLine>) {
    let (tx, rx) = mpsc::channel(LOG_BUFFER);
    (TaskLogger::new(tx), rx)
}

/// Spawn the relay task for one invocation. It exits when the channel
/// closes (all logger handles dropped) or the stream fails.
pub fn spawn_relay(
    sink: Arc<dyn DispatchSink>,
    unique_id: String,
    mut rx: mpsc::Receiver<LogLine>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream: Option<Box<dyn LogStream>> = None;
        while let Some(line) = rx.recv().await {
            let content = line.render();

            if stream.is_none() {
                match sink.open_log_stream().await {
                    Ok(s) => stream = Some(s),
                    Err(err) => {
                        warn!(
                            unique_task_id = %unique_id,
                            error = %err,
                            "failed to open log stream, dropping remaining lines"
                        );
                        break;
                    }
                }
            }

            let s = stream.as_mut().expect("stream opened above");
            match s.append(&unique_id, &content).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(unique_task_id = %unique_id, "dispatch did not store log line");
                }
                Err(err) => {
                    warn!(
                        unique_task_id = %unique_id,
                        error = %err,
                        "log stream failed, dropping remaining lines"
                    );
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    #[test]
    fn test_render_prefixes_severity() {
        let line = LogLine {
            level: LogLevel::Warning,
            content: "disk almost full".to_string(),
        };
        assert_eq!(line.render(), "[WARNING] disk almost full");
    }

    #[tokio::test]
    async fn test_relay_preserves_enqueue_order() {
        let sink = Arc::new(RecordingSink::new());
        let (logger, rx) = log_pipe();
        let relay = spawn_relay(sink.clone(), "u1".to_string(), rx);

        for n in 0..10 {
            logger.info(format!("line {n}")).await;
        }
        drop(logger);
        relay.await.expect("relay join");

        let logs = sink.logs_for("u1");
        assert_eq!(logs.len(), 10);
        for (n, content) in logs.iter().enumerate() {
            assert_eq!(content, &format!("[INFO] line {n}"));
        }
    }

    #[tokio::test]
    async fn test_relay_exits_on_channel_close_without_lines() {
        let sink = Arc::new(RecordingSink::new());
        let (logger, rx) = log_pipe();
        let relay = spawn_relay(sink.clone(), "u2".to_string(), rx);
        drop(logger);
        relay.await.expect("relay join");
        assert!(sink.logs_for("u2").is_empty());
    }
}
