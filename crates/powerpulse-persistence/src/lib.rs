//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

use async_trait::async_trait;
use powerpulse_msg::{FinishedSample, SourceKind};

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing sample logs.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Log header written by an incompatible version.
    #[error("unsupported sample log version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u16,
        /// Version this build writes.
        expected: u16,
    },
    /// Blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
    /// The backing store refused the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Durable append-only record store for finished samples.
#[async_trait]
pub trait SampleStore: Send + Sync + 'static {
    /// Append one finished sample. Returns the per-source sequence number assigned.
    async fn append(&self, sample: &FinishedSample) -> Result<u64>;

    /// Most recent `limit` samples sorted by timestamp descending, optionally
    /// restricted to one source.
    async fn recent(
        &self,
        source: Option<SourceKind>,
        limit: usize,
    ) -> Result<Vec<FinishedSample>>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

pub mod jsonl;
pub mod memory;
pub mod metrics;
pub mod sample_log;

pub use jsonl::{JsonlSampleStore, DEFAULT_TAIL_CAPACITY};
pub use memory::MemorySampleStore;
pub use metrics::PersistenceMetrics;
pub use sample_log::{replay, SampleLogEntry, SampleLogReader, SampleLogWriter, SAMPLE_LOG_VERSION};

/// Sort newest first and keep at most `limit` samples.
pub(crate) fn newest_first(mut samples: Vec<FinishedSample>, limit: usize) -> Vec<FinishedSample> {
    samples.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    samples.truncate(limit);
    samples
}
