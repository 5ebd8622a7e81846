//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound telemetry sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::warn;

/// Producer of raw telemetry events.
#[async_trait]
pub trait TelemetrySource: Send {
    /// Next raw event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<Value>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Newline-delimited JSON events read from a file, stdin, or any reader.
pub struct JsonLinesSource {
    lines: Lines<BufReader<BoxedReader>>,
    label: String,
    line_number: u64,
}

impl JsonLinesSource {
    /// Wrap an arbitrary reader.
    pub fn from_reader<R>(reader: R, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: BoxedReader = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
            label: label.into(),
            line_number: 0,
        }
    }

    /// Read events from a file.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(file, path.display().to_string()))
    }

    /// Read events from standard input.
    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin(), "stdin")
    }
}

#[async_trait]
impl TelemetrySource for JsonLinesSource {
    async fn next_event(&mut self) -> Option<Value> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    warn!(input = %self.label, error = %err, "telemetry input failed");
                    return None;
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => return Some(value),
                Err(err) => {
                    warn!(input = %self.label, line = self.line_number, error = %err, "skipping unparseable telemetry line");
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Events pushed in-process through a bounded channel.
pub struct ChannelSource {
    receiver: mpsc::Receiver<Value>,
}

impl ChannelSource {
    /// Create the source together with the sender used to feed it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Value>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver })
    }
}

#[async_trait]
impl TelemetrySource for ChannelSource {
    async fn next_event(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    fn describe(&self) -> String {
        "channel".to_owned()
    }
}
