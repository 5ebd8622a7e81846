//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use powerpulse_msg::OutboundMessage;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Fan-out seam used by the distribution hub.
pub trait Broadcast: Send + Sync + 'static {
    /// Deliver `message` to every open subscriber. Returns the number reached.
    fn broadcast(&self, message: &OutboundMessage) -> usize;
}

/// Identity of one connected subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Prometheus instruments for the subscriber transport.
#[derive(Clone)]
pub struct TransportMetrics {
    subscribers: IntGauge,
    deliveries: IntCounterVec,
}

impl TransportMetrics {
    /// Register transport metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let subscribers = IntGauge::with_opts(Opts::new(
            "powerpulse_live_subscribers",
            "Number of currently registered real-time subscribers",
        ))?;
        registry.register(Box::new(subscribers.clone()))?;

        let deliveries = IntCounterVec::new(
            Opts::new(
                "powerpulse_broadcast_deliveries_total",
                "Per-subscriber broadcast delivery attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(deliveries.clone()))?;

        Ok(Self {
            subscribers,
            deliveries,
        })
    }
}

struct SubscriberHandle {
    sender: mpsc::Sender<Arc<str>>,
    open: Arc<AtomicBool>,
}

/// Receiving half handed to a transport session.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<str>>,
    open: Arc<AtomicBool>,
}

impl Subscription {
    /// Identity assigned at registration.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Mark the session ready to receive broadcasts.
    pub fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Stop accepting broadcasts while the session winds down.
    pub fn mark_closing(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Next queued message, or `None` once the subscriber was removed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }
}

struct RegistryInner {
    subscribers: RwLock<HashMap<SubscriberId, SubscriberHandle>>,
    queue_capacity: usize,
    metrics: Option<TransportMetrics>,
}

/// Concurrency-safe set of live subscribers.
///
/// Every subscriber owns a bounded queue. A broadcast serialises the message
/// once and offers it to each open subscriber; a full queue drops the message
/// for that subscriber only, and a closed queue removes the subscriber.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    /// Create a registry whose subscribers buffer up to `queue_capacity` messages.
    pub fn new(queue_capacity: usize) -> Self {
        Self::build(queue_capacity, None)
    }

    /// Create a registry that reports into `metrics`.
    pub fn with_metrics(queue_capacity: usize, metrics: TransportMetrics) -> Self {
        Self::build(queue_capacity, Some(metrics))
    }

    fn build(queue_capacity: usize, metrics: Option<TransportMetrics>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscribers: RwLock::new(HashMap::new()),
                queue_capacity: queue_capacity.max(1),
                metrics,
            }),
        }
    }

    /// Add a subscriber. It receives nothing until [`Subscription::mark_open`].
    pub fn register(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity);
        let open = Arc::new(AtomicBool::new(false));
        let id = SubscriberId(Uuid::new_v4());
        let count = {
            let mut subscribers = self.inner.subscribers.write();
            subscribers.insert(
                id,
                SubscriberHandle {
                    sender,
                    open: open.clone(),
                },
            );
            subscribers.len()
        };
        self.set_gauge(count);
        debug!(subscriber = %id, subscribers = count, "subscriber registered");
        Subscription { id, receiver, open }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.inner.subscribers.write();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            self.set_gauge(count);
            debug!(subscriber = %id, subscribers = count, "subscriber unregistered");
        }
        removed
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// True when nobody is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer an already serialised payload to every open subscriber.
    pub fn broadcast_text(&self, text: Arc<str>) -> usize {
        let mut reached = 0usize;
        let mut closed = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (id, handle) in subscribers.iter() {
                if !handle.open.load(Ordering::Acquire) {
                    continue;
                }
                match handle.sender.try_send(text.clone()) {
                    Ok(()) => {
                        reached += 1;
                        self.count_delivery("delivered");
                    }
                    Err(TrySendError::Full(_)) => {
                        debug!(subscriber = %id, "subscriber queue full; message dropped");
                        self.count_delivery("dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.count_delivery("closed");
                        closed.push(*id);
                    }
                }
            }
        }
        for id in closed {
            self.unregister(id);
        }
        reached
    }

    fn count_delivery(&self, outcome: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.deliveries.with_label_values(&[outcome]).inc();
        }
    }

    fn set_gauge(&self, count: usize) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.subscribers.set(count as i64);
        }
    }
}

impl Broadcast for SubscriberRegistry {
    fn broadcast(&self, message: &OutboundMessage) -> usize {
        match message.to_json() {
            Ok(text) => self.broadcast_text(Arc::from(text)),
            Err(err) => {
                warn!(error = %err, "failed to serialise broadcast message");
                0
            }
        }
    }
}
