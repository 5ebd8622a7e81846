//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use powerpulse_persistence::SampleStore;
use powerpulse_predict::PredictionService;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::SubscriberRegistry;
use crate::{rest, websocket};

/// Default number of samples returned by the history routes.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Shared state injected into the axum handlers.
pub(crate) struct AppState {
    pub(crate) registry: SubscriberRegistry,
    pub(crate) store: Arc<dyn SampleStore>,
    pub(crate) prediction: Option<Arc<dyn PredictionService>>,
    pub(crate) metrics: Option<Arc<Registry>>,
    pub(crate) history_limit: usize,
}

/// Builder for the HTTP server carrying `/ws`, the history API, and `/metrics`.
#[derive(Clone)]
pub struct ServerBuilder {
    listen: SocketAddr,
    registry: SubscriberRegistry,
    store: Arc<dyn SampleStore>,
    prediction: Option<Arc<dyn PredictionService>>,
    metrics: Option<Arc<Registry>>,
    history_limit: usize,
}

impl ServerBuilder {
    /// Construct a builder from mandatory components.
    pub fn new(
        listen: SocketAddr,
        registry: SubscriberRegistry,
        store: Arc<dyn SampleStore>,
    ) -> Self {
        Self {
            listen,
            registry,
            store,
            prediction: None,
            metrics: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Number of samples returned by `/api/grid-data` and `/api/generator-data`.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Enable `/api/test-ml` backed by `service`.
    pub fn with_prediction(mut self, service: Arc<dyn PredictionService>) -> Self {
        self.prediction = Some(service);
        self
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: Arc<Registry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Spawn the server and return a handle that can be used for shutdown.
    pub async fn spawn(self) -> anyhow::Result<ServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, store = self.store.name(), "powerpulse server listening");

        let state = AppState {
            registry: self.registry,
            store: self.store,
            prediction: self.prediction,
            metrics: self.metrics,
            history_limit: self.history_limit,
        };
        // Dashboards connect at the bare address; `/ws` is kept as an alias.
        let router = Router::new()
            .route("/", get(websocket::upgrade_handler))
            .route("/ws", get(websocket::upgrade_handler))
            .route("/api/grid-data", get(rest::get_grid_data))
            .route("/api/generator-data", get(rest::get_generator_data))
            .route("/api/test-ml", post(rest::post_test_ml))
            .route("/metrics", get(rest::get_metrics))
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "powerpulse server exited with error");
            }
        });

        Ok(ServerHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`ServerBuilder::spawn`].
pub struct ServerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// Retrieve the socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}
