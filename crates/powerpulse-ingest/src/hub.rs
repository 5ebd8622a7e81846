//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fan-out of fragments and finished samples."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use powerpulse_msg::{FinishedSample, Fragment, OutboundMessage, SourceKind, UpdateStage};
use powerpulse_net::Broadcast;
use powerpulse_persistence::{PersistenceError, SampleStore};
use tracing::{debug, error};

use crate::accumulator::preview;
use crate::decoder::DecodeError;
use crate::metrics::IngestMetrics;

/// What happened to one raw event.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Dropped by the decoder.
    Rejected(DecodeError),
    /// Absorbed; the source's sample is still incomplete.
    Pending {
        /// Source the fragment belonged to.
        source: SourceKind,
    },
    /// Completed a sample that was persisted and broadcast.
    Delivered {
        /// Source of the finished sample.
        source: SourceKind,
        /// Subscribers that accepted the complete update.
        reached: usize,
    },
    /// Completed a sample that was broadcast but could not be stored.
    PersistFailed {
        /// Source of the finished sample.
        source: SourceKind,
        /// Subscribers that accepted the complete update.
        reached: usize,
        /// Storage failure.
        error: PersistenceError,
    },
}

impl IngestOutcome {
    /// Metric label for the outcome.
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Rejected(_) => "rejected",
            IngestOutcome::Pending { .. } => "pending",
            IngestOutcome::Delivered { .. } => "delivered",
            IngestOutcome::PersistFailed { .. } => "persist_failed",
        }
    }
}

/// Persists finished samples and broadcasts every update.
#[derive(Clone)]
pub struct DistributionHub {
    store: Arc<dyn SampleStore>,
    broadcaster: Arc<dyn Broadcast>,
    metrics: Option<IngestMetrics>,
}

impl DistributionHub {
    /// Create a hub over a store and a broadcaster.
    pub fn new(store: Arc<dyn SampleStore>, broadcaster: Arc<dyn Broadcast>) -> Self {
        Self {
            store,
            broadcaster,
            metrics: None,
        }
    }

    /// Report broadcast reach and persistence failures into `metrics`.
    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Best-effort partial update built from the fragment alone.
    pub fn publish_fragment_preview(&self, fragment: &Fragment) -> usize {
        let reached = self
            .broadcaster
            .broadcast(&OutboundMessage::partial(preview(fragment)));
        if let Some(metrics) = &self.metrics {
            metrics.record_reached(UpdateStage::Partial, reached);
        }
        reached
    }

    /// Persist, then broadcast regardless of whether persistence succeeded.
    pub async fn publish_finished_sample(&self, sample: &FinishedSample) -> IngestOutcome {
        let source = sample.source;
        let persisted = self.store.append(sample).await;
        if let Err(err) = &persisted {
            error!(source = %source, store = self.store.name(), error = %err, "failed to persist sample");
            if let Some(metrics) = &self.metrics {
                metrics.record_persist_failure(source);
            }
        }

        let reached = self
            .broadcaster
            .broadcast(&OutboundMessage::complete(sample));
        if let Some(metrics) = &self.metrics {
            metrics.record_reached(UpdateStage::Complete, reached);
        }

        match persisted {
            Ok(sequence) => {
                debug!(source = %source, sequence, reached, "sample delivered");
                IngestOutcome::Delivered { source, reached }
            }
            Err(error) => IngestOutcome::PersistFailed {
                source,
                reached,
                error,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use powerpulse_msg::{PhaseTriple, Reading};
    use powerpulse_persistence::MemorySampleStore;

    #[derive(Default)]
    pub(crate) struct RecordingBroadcast {
        pub(crate) messages: Mutex<Vec<OutboundMessage>>,
    }

    impl Broadcast for RecordingBroadcast {
        fn broadcast(&self, message: &OutboundMessage) -> usize {
            self.messages.lock().push(message.clone());
            1
        }
    }

    pub(crate) struct FailingStore;

    #[async_trait]
    impl SampleStore for FailingStore {
        async fn append(&self, _sample: &FinishedSample) -> powerpulse_persistence::Result<u64> {
            Err(PersistenceError::Unavailable("disk full".into()))
        }

        async fn recent(
            &self,
            _source: Option<SourceKind>,
            _limit: usize,
        ) -> powerpulse_persistence::Result<Vec<FinishedSample>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn sample() -> FinishedSample {
        FinishedSample {
            source: SourceKind::Grid,
            timestamp: Utc::now(),
            voltage: PhaseTriple::new(230.0, 231.0, 229.0),
            current: PhaseTriple::new(10.0, 11.0, 9.0),
            active_power: PhaseTriple::default(),
            power_factor: 0.95,
            thd: None,
            avg_voltage: Some(230.0),
            avg_current: Some(10.0),
            avg_active_power: None,
        }
    }

    #[tokio::test]
    async fn persistence_failure_still_broadcasts_once() {
        let broadcaster = Arc::new(RecordingBroadcast::default());
        let hub = DistributionHub::new(Arc::new(FailingStore), broadcaster.clone());

        let outcome = hub.publish_finished_sample(&sample()).await;
        assert!(matches!(
            outcome,
            IngestOutcome::PersistFailed {
                source: SourceKind::Grid,
                reached: 1,
                error: PersistenceError::Unavailable(_),
            }
        ));

        let messages = broadcaster.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].stage, UpdateStage::Complete);
        assert_eq!(messages[0].data.avg_voltage, Some(230.0));
    }

    #[tokio::test]
    async fn finished_samples_are_stored_then_broadcast() {
        let store = Arc::new(MemorySampleStore::new());
        let broadcaster = Arc::new(RecordingBroadcast::default());
        let hub = DistributionHub::new(store.clone(), broadcaster.clone());

        let outcome = hub.publish_finished_sample(&sample()).await;
        assert!(matches!(outcome, IngestOutcome::Delivered { reached: 1, .. }));
        assert_eq!(store.len(), 1);
        assert_eq!(broadcaster.messages.lock().len(), 1);
    }

    #[test]
    fn previews_are_tagged_partial() {
        let broadcaster = Arc::new(RecordingBroadcast::default());
        let hub = DistributionHub::new(Arc::new(MemorySampleStore::new()), broadcaster.clone());
        let fragment = Fragment::new(SourceKind::Generator, Reading::PowerFactor(0.8));

        assert_eq!(hub.publish_fragment_preview(&fragment), 1);
        let messages = broadcaster.messages.lock();
        assert_eq!(messages[0].stage, UpdateStage::Partial);
        assert_eq!(messages[0].data.power_factor, Some(0.8));
        assert_eq!(messages[0].data.source, Some(SourceKind::Generator));
    }
}
