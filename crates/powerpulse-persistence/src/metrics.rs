//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, CounterVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the sample store.
#[derive(Clone)]
pub struct PersistenceMetrics {
    samples_saved: IntCounterVec,
    samples_failed: IntCounterVec,
    log_bytes: CounterVec,
    query_duration: HistogramVec,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let samples_saved = IntCounterVec::new(
            Opts::new(
                "powerpulse_samples_saved_total",
                "Total number of finished samples successfully persisted",
            ),
            &["source"],
        )?;
        registry.register(Box::new(samples_saved.clone()))?;

        let samples_failed = IntCounterVec::new(
            Opts::new(
                "powerpulse_samples_save_failed_total",
                "Total number of finished sample writes that failed",
            ),
            &["source"],
        )?;
        registry.register(Box::new(samples_failed.clone()))?;

        let log_bytes = CounterVec::new(
            Opts::new(
                "powerpulse_sample_log_bytes_total",
                "Total bytes appended to sample logs",
            ),
            &["source"],
        )?;
        registry.register(Box::new(log_bytes.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "powerpulse_history_query_seconds",
            "Duration spent answering history queries",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 12)?);
        let query_duration = HistogramVec::new(histogram_opts, &["source"])?;
        registry.register(Box::new(query_duration.clone()))?;

        Ok(Self {
            samples_saved,
            samples_failed,
            log_bytes,
            query_duration,
        })
    }

    /// Record a successful append.
    pub fn record_saved(&self, source: &str, bytes: usize) {
        self.samples_saved.with_label_values(&[source]).inc();
        self.log_bytes
            .with_label_values(&[source])
            .inc_by(bytes as f64);
    }

    /// Record a failed append.
    pub fn record_failed(&self, source: &str) {
        self.samples_failed.with_label_values(&[source]).inc();
    }

    /// Observe the duration of a history query. `source` is `all` for unfiltered queries.
    pub fn observe_query(&self, source: &str, seconds: f64) {
        self.query_duration
            .with_label_values(&[source])
            .observe(seconds);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
