//! Logging collaborator.
//!
//! Any part of the process reports through `tracing`; [`ErrorLogLayer`]
//! turns each event into a [`LogMessage`] and hands it to a collector task
//! that owns the log files. Errors are appended to a persistent error log so
//! failed tables can be investigated after the run. The collector flushes
//! and stops when it receives [`LogMessage::Exit`].

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::error::Result;

/// Default error log location.
pub const DEFAULT_ERROR_LOG: &str = "errors-only.log";

/// Message sent to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    /// Informational line, written to the full log only.
    Log(String),
    /// Error line, written to the error log and the full log.
    Error(String),
    /// Effective configuration, written to both logs.
    Config(String),
    /// Flush and terminate.
    Exit,
}

/// A tracing layer that forwards events to the collector.
#[derive(Clone)]
pub struct ErrorLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl<S> Layer<S> for ErrorLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();

        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);

        let line = format!("[{:5}] {}", level, visitor.message);
        let message = if level == Level::ERROR {
            LogMessage::Error(line)
        } else {
            LogMessage::Log(line)
        };

        // Collector gone means logging is shutting down
        let _ = self.tx.send(message);
    }
}

/// Handle to the running collector.
pub struct ErrorLog {
    tx: mpsc::UnboundedSender<LogMessage>,
    task: JoinHandle<Result<()>>,
    path: PathBuf,
}

impl ErrorLog {
    /// Open the error log (and the optional full log) in append mode and
    /// start the collector.
    pub async fn open(error_log: impl AsRef<Path>, full_log: Option<&Path>) -> Result<Self> {
        let path = error_log.as_ref().to_path_buf();
        let errors = append(&path).await?;
        let full = match full_log {
            Some(p) => Some(append(p).await?),
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(collect(rx, errors, full));

        Ok(Self { tx, task, path })
    }

    /// Layer to install on the subscriber.
    pub fn layer(&self) -> ErrorLogLayer {
        ErrorLogLayer {
            tx: self.tx.clone(),
        }
    }

    /// Record the effective configuration.
    pub fn config(&self, summary: impl Into<String>) {
        let _ = self.tx.send(LogMessage::Config(summary.into()));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `Exit` and wait until everything queued before it is on disk.
    pub async fn close(self) -> Result<()> {
        let _ = self.tx.send(LogMessage::Exit);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e).into()),
        }
    }
}

async fn append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

async fn collect(
    mut rx: mpsc::UnboundedReceiver<LogMessage>,
    mut errors: File,
    mut full: Option<File>,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        match message {
            LogMessage::Log(line) => {
                if let Some(f) = full.as_mut() {
                    f.write_all(format!("{} {}\n", stamp, line).as_bytes())
                        .await?;
                }
            }
            LogMessage::Error(line) => {
                let entry = format!("{} {}\n", stamp, line);
                errors.write_all(entry.as_bytes()).await?;
                if let Some(f) = full.as_mut() {
                    f.write_all(entry.as_bytes()).await?;
                }
            }
            LogMessage::Config(summary) => {
                let entry = format!("{} [CONFIG] {}\n", stamp, summary);
                errors.write_all(entry.as_bytes()).await?;
                if let Some(f) = full.as_mut() {
                    f.write_all(entry.as_bytes()).await?;
                }
            }
            LogMessage::Exit => break,
        }
    }

    errors.flush().await?;
    if let Some(f) = full.as_mut() {
        f.flush().await?;
    }
    Ok(())
}

/// Visitor for extracting the message from a tracing event.
struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
        }
    }

    fn field(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.message.is_empty() {
            self.message.push(' ');
        }
        let _ = write!(self.message, "{}={}", name, value);
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.field(field.name(), format!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.field(field.name(), value);
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.field(field.name(), value);
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.field(field.name(), value);
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.field(field.name(), value);
    }
}
