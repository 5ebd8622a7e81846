//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Ingestion metrics."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use powerpulse_msg::{FieldKind, SourceKind, UpdateStage};
use prometheus::{IntCounterVec, Opts, Registry};

/// Counters describing what the ingestion pipeline did with each event.
#[derive(Clone)]
pub struct IngestMetrics {
    events: IntCounterVec,
    fragments: IntCounterVec,
    completed: IntCounterVec,
    persist_failures: IntCounterVec,
    reached: IntCounterVec,
}

impl IngestMetrics {
    /// Register all ingestion metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let events = IntCounterVec::new(
            Opts::new(
                "powerpulse_ingest_events_total",
                "Raw telemetry events processed, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(events.clone()))?;

        let fragments = IntCounterVec::new(
            Opts::new(
                "powerpulse_fragments_total",
                "Decoded fragments by source and field",
            ),
            &["source", "field"],
        )?;
        registry.register(Box::new(fragments.clone()))?;

        let completed = IntCounterVec::new(
            Opts::new(
                "powerpulse_samples_completed_total",
                "Finished samples emitted by the accumulator",
            ),
            &["source"],
        )?;
        registry.register(Box::new(completed.clone()))?;

        let persist_failures = IntCounterVec::new(
            Opts::new(
                "powerpulse_persist_failures_total",
                "Finished samples broadcast without being persisted",
            ),
            &["source"],
        )?;
        registry.register(Box::new(persist_failures.clone()))?;

        let reached = IntCounterVec::new(
            Opts::new(
                "powerpulse_subscribers_reached_total",
                "Subscriber deliveries summed over broadcasts, by stage",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(reached.clone()))?;

        Ok(Self {
            events,
            fragments,
            completed,
            persist_failures,
            reached,
        })
    }

    /// Count one processed event.
    pub fn record_event(&self, outcome: &str) {
        self.events.with_label_values(&[outcome]).inc();
    }

    /// Count one decoded fragment.
    pub fn record_fragment(&self, source: SourceKind, field: FieldKind) {
        self.fragments
            .with_label_values(&[source.as_str(), field.as_str()])
            .inc();
    }

    /// Count one finished sample.
    pub fn record_completed(&self, source: SourceKind) {
        self.completed.with_label_values(&[source.as_str()]).inc();
    }

    /// Count one persistence failure.
    pub fn record_persist_failure(&self, source: SourceKind) {
        self.persist_failures
            .with_label_values(&[source.as_str()])
            .inc();
    }

    /// Add the number of subscribers a broadcast reached.
    pub fn record_reached(&self, stage: UpdateStage, reached: usize) {
        let label = match stage {
            UpdateStage::Partial => "partial",
            UpdateStage::Complete => "complete",
        };
        self.reached
            .with_label_values(&[label])
            .inc_by(reached as u64);
    }
}
