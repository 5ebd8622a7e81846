//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the PowerPulse daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use powerpulse_common::{init_tracing, load_env_file, AppConfig, StoreBackend, StoreConfig};
use powerpulse_ingest::{
    DistributionHub, IngestMetrics, IngestPipeline, JsonLinesSource, SampleAccumulator,
    TelemetrySource,
};
use powerpulse_msg::SourceKind;
use powerpulse_net::{ServerBuilder, SubscriberRegistry, TransportMetrics, DEFAULT_HISTORY_LIMIT};
use powerpulse_persistence::{
    JsonlSampleStore, MemorySampleStore, PersistenceMetrics, SampleStore, DEFAULT_TAIL_CAPACITY,
};
use powerpulse_predict::PredictionClient;
use prometheus::Registry;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "PowerPulse telemetry daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Override the server listen address")]
    listen: Option<SocketAddr>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Newline-delimited JSON telemetry input; '-' reads stdin"
    )]
    input: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSource {
    Grid,
    Generator,
}

impl From<CliSource> for SourceKind {
    fn from(value: CliSource) -> Self {
        match value {
            CliSource::Grid => SourceKind::Grid,
            CliSource::Generator => SourceKind::Generator,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Ingest telemetry and serve live subscribers")]
    Run,
    #[command(about = "Print the most recent stored samples as JSON")]
    Recent {
        #[arg(long, value_enum)]
        source: CliSource,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_file = load_env_file();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/powerpulse.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(input) = cli.input {
        config.stream.input = Some(input);
    }
    init_tracing("powerpulsed", &config.logging)?;

    if let Some(path) = &env_file {
        info!(env_file = %path.display(), "environment file loaded");
    }
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("configuration defaults in effect"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await?,
        Commands::Recent { source, limit } => {
            let store = open_store(&config.store, limit, None)?;
            let samples = store.recent(Some(source.into()), limit).await?;
            println!("{}", serde_json::to_string_pretty(&samples)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let metrics_registry = if config.metrics.enabled {
        Some(Arc::new(Registry::new()))
    } else {
        info!("metrics disabled by configuration");
        None
    };

    let store = open_store(
        &config.store,
        config.server.history_limit,
        metrics_registry.clone(),
    )?;
    let subscribers = match &metrics_registry {
        Some(registry) => SubscriberRegistry::with_metrics(
            config.server.subscriber_queue,
            TransportMetrics::new(registry.clone())?,
        ),
        None => SubscriberRegistry::new(config.server.subscriber_queue),
    };

    let mut builder = ServerBuilder::new(config.server.listen, subscribers.clone(), store.clone())
        .with_history_limit(config.server.history_limit);
    if config.prediction.enabled {
        let client = PredictionClient::new(&config.prediction.base_url, config.prediction.timeout)
            .context("failed to build prediction client")?;
        info!(base_url = %config.prediction.base_url, "prediction service enabled");
        builder = builder.with_prediction(Arc::new(client));
    }
    if let Some(registry) = &metrics_registry {
        builder = builder.with_metrics_registry(registry.clone());
    }
    let server = builder.spawn().await?;

    let mut hub = DistributionHub::new(store, Arc::new(subscribers));
    let mut pipeline_metrics = None;
    if let Some(registry) = &metrics_registry {
        let metrics = IngestMetrics::new(registry.clone())?;
        hub = hub.with_metrics(metrics.clone());
        pipeline_metrics = Some(metrics);
    }
    let mut pipeline = IngestPipeline::new(
        SampleAccumulator::new(config.accumulator.max_pending_age),
        hub,
    );
    if let Some(metrics) = pipeline_metrics {
        pipeline = pipeline.with_metrics(metrics);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingest_task = match &config.stream.input {
        Some(input) => {
            let mut source = open_source(input).await?;
            Some(tokio::spawn(async move {
                pipeline.run(source.as_mut(), shutdown_rx).await
            }))
        }
        None => {
            warn!("no telemetry input configured; serving history and subscribers only");
            None
        }
    };

    info!(address = %server.local_addr(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(task) = ingest_task {
        let summary = task.await.context("ingestion task failed")?;
        info!(
            events = summary.events,
            delivered = summary.delivered,
            persist_failed = summary.persist_failed,
            "ingestion summary"
        );
    }
    server.shutdown().await?;
    Ok(())
}

fn open_store(
    config: &StoreConfig,
    history_limit: usize,
    registry: Option<Arc<Registry>>,
) -> Result<Arc<dyn SampleStore>> {
    match config.backend {
        StoreBackend::Jsonl => {
            let metrics = registry.map(PersistenceMetrics::new).transpose()?;
            let capacity = history_limit.max(DEFAULT_TAIL_CAPACITY);
            let store = JsonlSampleStore::open_with_tail_capacity(
                config.directory.clone(),
                metrics,
                capacity,
            )
            .with_context(|| {
                format!("failed to open sample store at {}", config.directory.display())
            })?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("memory store selected; samples are lost on exit");
            Ok(Arc::new(MemorySampleStore::new()))
        }
    }
}

async fn open_source(input: &str) -> Result<Box<dyn TelemetrySource>> {
    if input == "-" {
        return Ok(Box::new(JsonLinesSource::stdin()));
    }
    let path = Path::new(input);
    let source = JsonLinesSource::open(path)
        .await
        .with_context(|| format!("failed to open telemetry input {}", path.display()))?;
    Ok(Box::new(source))
}
