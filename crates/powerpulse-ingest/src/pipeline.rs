//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Ingestion pipeline driving decode, accumulate, distribute."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::accumulator::SampleAccumulator;
use crate::decoder::{decode, DecodeError};
use crate::hub::{DistributionHub, IngestOutcome};
use crate::metrics::IngestMetrics;
use crate::source::TelemetrySource;

/// Per-outcome totals for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Events read from the source.
    pub events: u64,
    /// Events dropped by the decoder.
    pub rejected: u64,
    /// Fragments absorbed without completing a sample.
    pub pending: u64,
    /// Samples persisted and broadcast.
    pub delivered: u64,
    /// Samples broadcast after a persistence failure.
    pub persist_failed: u64,
}

impl IngestSummary {
    /// Fold one outcome into the totals.
    pub fn record(&mut self, outcome: &IngestOutcome) {
        self.events += 1;
        match outcome {
            IngestOutcome::Rejected(_) => self.rejected += 1,
            IngestOutcome::Pending { .. } => self.pending += 1,
            IngestOutcome::Delivered { .. } => self.delivered += 1,
            IngestOutcome::PersistFailed { .. } => self.persist_failed += 1,
        }
    }
}

/// Single owner of the accumulator; events are processed strictly one at a time.
pub struct IngestPipeline {
    accumulator: SampleAccumulator,
    hub: DistributionHub,
    metrics: Option<IngestMetrics>,
}

impl IngestPipeline {
    /// Assemble a pipeline from its accumulator and hub.
    pub fn new(accumulator: SampleAccumulator, hub: DistributionHub) -> Self {
        Self {
            accumulator,
            hub,
            metrics: None,
        }
    }

    /// Report outcomes and fragment counts into `metrics`.
    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Read-only access to the accumulator state.
    pub fn accumulator(&self) -> &SampleAccumulator {
        &self.accumulator
    }

    /// Decode, preview, accumulate, and distribute one raw event.
    pub async fn ingest(&mut self, event: &Value) -> IngestOutcome {
        let outcome = self.process(event).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_event(outcome.label());
        }
        outcome
    }

    async fn process(&mut self, event: &Value) -> IngestOutcome {
        let fragment = match decode(event) {
            Ok(fragment) => fragment,
            Err(err) => {
                // Unrecognized fields are already reported by the decoder.
                if !matches!(err, DecodeError::UnrecognizedField { .. }) {
                    warn!(error = %err, "telemetry event rejected");
                }
                return IngestOutcome::Rejected(err);
            }
        };

        let source = fragment.source;
        debug!(source = %source, field = fragment.field().as_str(), "fragment decoded");
        if let Some(metrics) = &self.metrics {
            metrics.record_fragment(source, fragment.field());
        }

        self.hub.publish_fragment_preview(&fragment);

        match self.accumulator.accumulate(&fragment) {
            None => IngestOutcome::Pending { source },
            Some(sample) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_completed(source);
                }
                self.hub.publish_finished_sample(&sample).await
            }
        }
    }

    /// Drain `source` until it is exhausted or `shutdown` fires.
    pub async fn run<S>(&mut self, source: &mut S, mut shutdown: watch::Receiver<bool>) -> IngestSummary
    where
        S: TelemetrySource + ?Sized,
    {
        let mut summary = IngestSummary::default();
        let input = source.describe();
        info!(input = %input, "ingestion started");

        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = source.next_event() => event,
            };
            let Some(event) = event else {
                break;
            };
            let outcome = self.ingest(&event).await;
            summary.record(&outcome);
        }

        info!(
            input = %input,
            events = summary.events,
            rejected = summary.rejected,
            delivered = summary.delivered,
            persist_failed = summary.persist_failed,
            "ingestion stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{FailingStore, RecordingBroadcast};
    use crate::source::ChannelSource;
    use powerpulse_msg::{SourceKind, UpdateStage};
    use powerpulse_persistence::{MemorySampleStore, SampleStore};
    use prometheus::Registry;
    use serde_json::json;
    use std::sync::Arc;

    fn event(server_id: i64, name: &str, data: &str) -> Value {
        json!({"Powerpulse": {"server_id": server_id, "addr": 1, "name": name, "data": data}})
    }

    fn pipeline(
        store: Arc<dyn SampleStore>,
    ) -> (IngestPipeline, Arc<RecordingBroadcast>) {
        let broadcaster = Arc::new(RecordingBroadcast::default());
        let hub = DistributionHub::new(store, broadcaster.clone());
        (
            IngestPipeline::new(SampleAccumulator::default(), hub),
            broadcaster,
        )
    }

    #[tokio::test]
    async fn grid_scenario_end_to_end() {
        let store = Arc::new(MemorySampleStore::new());
        let (mut pipeline, broadcaster) = pipeline(store.clone());

        let first = pipeline.ingest(&event(1, "voltage1", "[230,231,229]")).await;
        assert!(matches!(first, IngestOutcome::Pending { source: SourceKind::Grid }));
        pipeline.ingest(&event(1, "ryb_current", "[10,11,9]")).await;
        let last = pipeline.ingest(&event(1, "avg_pf", "[0.95]")).await;
        assert!(matches!(
            last,
            IngestOutcome::Delivered {
                source: SourceKind::Grid,
                reached: 1
            }
        ));

        let stored = store.snapshot();
        assert_eq!(stored.len(), 1);
        assert!((stored[0].avg_voltage.unwrap() - 230.0).abs() < 1e-9);
        assert!((stored[0].avg_current.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(stored[0].power_factor, 0.95);
        assert!(pipeline.accumulator().pending(SourceKind::Grid).is_empty());

        let messages = broadcaster.messages.lock();
        let stages: Vec<_> = messages.iter().map(|message| message.stage).collect();
        assert_eq!(
            stages,
            vec![
                UpdateStage::Partial,
                UpdateStage::Partial,
                UpdateStage::Partial,
                UpdateStage::Complete
            ]
        );
    }

    #[tokio::test]
    async fn unrecognized_fields_never_reach_the_accumulator() {
        let (mut pipeline, broadcaster) = pipeline(Arc::new(MemorySampleStore::new()));

        let outcome = pipeline.ingest(&event(2, "humidity", "[41]")).await;
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(DecodeError::UnrecognizedField { .. })
        ));
        assert!(pipeline.accumulator().pending(SourceKind::Generator).is_empty());
        assert!(broadcaster.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_but_broadcast() {
        let (mut pipeline, broadcaster) = pipeline(Arc::new(FailingStore));
        pipeline.ingest(&event(2, "voltage", "[415,414,416]")).await;
        pipeline.ingest(&event(2, "ryb_current", "[20,21,19]")).await;
        let outcome = pipeline.ingest(&event(2, "avg_pf", "[0.8]")).await;

        assert!(matches!(
            outcome,
            IngestOutcome::PersistFailed {
                source: SourceKind::Generator,
                ..
            }
        ));
        let complete = broadcaster
            .messages
            .lock()
            .iter()
            .filter(|message| message.stage == UpdateStage::Complete)
            .count();
        assert_eq!(complete, 1);
    }

    #[tokio::test]
    async fn run_drains_a_source_and_counts_outcomes() {
        let prom = Arc::new(Registry::new());
        let metrics = IngestMetrics::new(prom.clone()).unwrap();
        let (pipeline, _broadcaster) = pipeline(Arc::new(MemorySampleStore::new()));
        let mut pipeline = pipeline.with_metrics(metrics);

        let (sender, mut source) = ChannelSource::channel(8);
        for value in [
            event(1, "voltage1", "[230,231,229]"),
            event(9, "avg_pf", "[1]"),
            event(1, "ryb_current", "[10,11,9]"),
            event(1, "avg_pf", "[0.95]"),
        ] {
            sender.send(value).await.unwrap();
        }
        drop(sender);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let summary = pipeline.run(&mut source, shutdown_rx).await;
        assert_eq!(
            summary,
            IngestSummary {
                events: 4,
                rejected: 1,
                pending: 2,
                delivered: 1,
                persist_failed: 0,
            }
        );

        let events = prom
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "powerpulse_ingest_events_total")
            .unwrap();
        let total: f64 = events
            .get_metric()
            .iter()
            .map(|metric| metric.get_counter().get_value())
            .sum();
        assert_eq!(total, 4.0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (mut pipeline, _broadcaster) = pipeline(Arc::new(MemorySampleStore::new()));
        let (_sender, mut source) = ChannelSource::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = shutdown_tx.send(true);
            shutdown_tx
        });
        let summary = pipeline.run(&mut source, shutdown_rx).await;
        assert_eq!(summary.events, 0);
        let _ = stopper.await;
    }
}
