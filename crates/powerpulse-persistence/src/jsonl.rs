//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use powerpulse_msg::{FinishedSample, SourceKind};
use tracing::{debug, warn};

use crate::metrics::PersistenceMetrics;
use crate::sample_log::{SampleLogReader, SampleLogWriter};
use crate::{newest_first, PersistenceError, Result, SampleStore};

/// Number of most recent samples per source kept in memory by default.
pub const DEFAULT_TAIL_CAPACITY: usize = 1024;

/// Writer plus an in-memory window over the newest entries of one log.
struct SourceLog {
    writer: SampleLogWriter,
    tail: VecDeque<FinishedSample>,
    capacity: usize,
    total: usize,
}

impl SourceLog {
    fn open(directory: &Path, source: SourceKind, capacity: usize) -> Result<Self> {
        let path = JsonlSampleStore::log_path(directory, source);
        let writer = SampleLogWriter::open(&path, source)?;
        let mut log = Self {
            writer,
            tail: VecDeque::with_capacity(capacity.min(DEFAULT_TAIL_CAPACITY)),
            capacity,
            total: 0,
        };
        for sample in JsonlSampleStore::read_source(directory, source)? {
            log.remember(sample);
        }
        Ok(log)
    }

    fn remember(&mut self, sample: FinishedSample) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.tail.len() == self.capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(sample);
    }

    /// Newest `limit` samples, or `None` when the window cannot answer.
    fn newest(&self, limit: usize) -> Option<Vec<FinishedSample>> {
        if limit > self.tail.len() && self.total > self.tail.len() {
            return None;
        }
        Some(self.tail.iter().rev().take(limit).cloned().collect())
    }
}

struct Inner {
    directory: PathBuf,
    logs: [Mutex<SourceLog>; 2],
    metrics: Option<PersistenceMetrics>,
}

/// Durable store keeping one append-only JSON-lines log per source
/// (`grid.jsonl`, `generator.jsonl`) under a directory.
///
/// The newest entries of each log are also held in memory, so history
/// queries within that window never touch the disk.
#[derive(Clone)]
pub struct JsonlSampleStore {
    inner: Arc<Inner>,
}

impl JsonlSampleStore {
    /// Open (or create) the logs under `directory`.
    pub fn open(directory: impl Into<PathBuf>, metrics: Option<PersistenceMetrics>) -> Result<Self> {
        Self::open_with_tail_capacity(directory, metrics, DEFAULT_TAIL_CAPACITY)
    }

    /// Open the logs, keeping the newest `capacity` samples per source in memory.
    pub fn open_with_tail_capacity(
        directory: impl Into<PathBuf>,
        metrics: Option<PersistenceMetrics>,
        capacity: usize,
    ) -> Result<Self> {
        let directory = directory.into();
        let logs = [
            Mutex::new(SourceLog::open(&directory, SourceKind::Grid, capacity)?),
            Mutex::new(SourceLog::open(&directory, SourceKind::Generator, capacity)?),
        ];
        debug!(directory = %directory.display(), capacity, "sample store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                directory,
                logs,
                metrics,
            }),
        })
    }

    /// Location of the log holding `source` samples.
    pub fn log_path(directory: &Path, source: SourceKind) -> PathBuf {
        directory.join(format!("{}.jsonl", source.as_str()))
    }

    fn read_source(directory: &Path, source: SourceKind) -> Result<Vec<FinishedSample>> {
        let path = Self::log_path(directory, source);
        let mut samples = Vec::new();
        for entry in SampleLogReader::open(&path)? {
            match entry {
                Ok(entry) => samples.push(entry.sample),
                Err(PersistenceError::Json(err)) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable sample log line");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl SampleStore for JsonlSampleStore {
    async fn append(&self, sample: &FinishedSample) -> Result<u64> {
        let inner = self.inner.clone();
        let owned = sample.clone();
        let source = sample.source;
        let outcome = tokio::task::spawn_blocking(move || {
            let mut log = inner.logs[owned.source.index()].lock();
            let appended = log.writer.append(&owned)?;
            log.remember(owned);
            Ok::<_, PersistenceError>(appended)
        })
        .await
        .map_err(|err| PersistenceError::Task(err.to_string()))
        .and_then(|result| result);

        match outcome {
            Ok((sequence, bytes)) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_saved(source.as_str(), bytes);
                }
                Ok(sequence)
            }
            Err(err) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_failed(source.as_str());
                }
                Err(err)
            }
        }
    }

    async fn recent(
        &self,
        source: Option<SourceKind>,
        limit: usize,
    ) -> Result<Vec<FinishedSample>> {
        let started = Instant::now();
        let sources: Vec<SourceKind> = match source {
            Some(kind) => vec![kind],
            None => SourceKind::ALL.to_vec(),
        };

        let mut samples = Vec::new();
        let mut rescan = Vec::new();
        for kind in sources {
            match self.inner.logs[kind.index()].lock().newest(limit) {
                Some(newest) => samples.extend(newest),
                None => rescan.push(kind),
            }
        }

        if !rescan.is_empty() {
            debug!(sources = ?rescan, limit, "history query exceeds in-memory window; reading logs");
            let directory = self.inner.directory.clone();
            let scanned = tokio::task::spawn_blocking(move || {
                let mut scanned = Vec::new();
                for kind in rescan {
                    scanned.extend(Self::read_source(&directory, kind)?);
                }
                Ok::<_, PersistenceError>(scanned)
            })
            .await
            .map_err(|err| PersistenceError::Task(err.to_string()))??;
            samples.extend(scanned);
        }

        if let Some(metrics) = &self.inner.metrics {
            let label = source.map_or("all", |kind| kind.as_str());
            metrics.observe_query(label, started.elapsed().as_secs_f64());
        }
        Ok(newest_first(samples, limit))
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}
