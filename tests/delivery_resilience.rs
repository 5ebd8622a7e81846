//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration and validation tests for the PowerPulse stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use powerpulse_ingest::{DistributionHub, IngestOutcome, IngestPipeline, SampleAccumulator};
use powerpulse_msg::{FinishedSample, SourceKind};
use powerpulse_net::{ServerBuilder, SubscriberRegistry};
use powerpulse_persistence::{PersistenceError, Result as StoreResult, SampleStore};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

struct OfflineStore;

#[async_trait]
impl SampleStore for OfflineStore {
    async fn append(&self, _sample: &FinishedSample) -> StoreResult<u64> {
        Err(PersistenceError::Unavailable("database offline".into()))
    }

    async fn recent(
        &self,
        _source: Option<SourceKind>,
        _limit: usize,
    ) -> StoreResult<Vec<FinishedSample>> {
        Err(PersistenceError::Unavailable("database offline".into()))
    }

    fn name(&self) -> &'static str {
        "offline"
    }
}

fn event(server_id: i64, name: &str, data: &str) -> Value {
    json!({"Powerpulse": {"server_id": server_id, "name": name, "data": data}})
}

async fn wait_for_subscribers(registry: &SubscriberRegistry, expected: usize) {
    for _ in 0..100 {
        if registry.len() == expected {
            sleep(Duration::from_millis(20)).await;
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} subscribers, found {}", registry.len());
}

async fn next_text<S>(socket: &mut S) -> Value
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("frame before timeout")
            .unwrap()
            .unwrap();
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn storage_outage_does_not_block_live_delivery() {
    let store: Arc<dyn SampleStore> = Arc::new(OfflineStore);
    let registry = SubscriberRegistry::new(16);
    let server = ServerBuilder::new(
        "127.0.0.1:0".parse().unwrap(),
        registry.clone(),
        store.clone(),
    )
    .spawn()
    .await
    .unwrap();

    let (mut socket, _response) = connect_async(format!("ws://{}/ws", server.local_addr()))
        .await
        .unwrap();
    wait_for_subscribers(&registry, 1).await;

    let hub = DistributionHub::new(store, Arc::new(registry.clone()));
    let mut pipeline = IngestPipeline::new(SampleAccumulator::default(), hub);
    pipeline
        .ingest(&event(2, "voltage", "[415, 414, 416]"))
        .await;
    pipeline
        .ingest(&event(2, "ryb_current", "[20, 21, 19]"))
        .await;
    let outcome = pipeline.ingest(&event(2, "avg_pf", "[0.8]")).await;
    assert!(matches!(
        outcome,
        IngestOutcome::PersistFailed {
            source: SourceKind::Generator,
            reached: 1,
            ..
        }
    ));

    let mut complete = Vec::new();
    for _ in 0..4 {
        let frame = next_text(&mut socket).await;
        if frame["stage"] == "complete" {
            complete.push(frame);
        }
    }
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0]["data"]["type"], "generator");
    assert!((complete[0]["data"]["avgVoltage"].as_f64().unwrap() - 415.0).abs() < 1e-9);

    let response = reqwest::get(format!("http://{}/api/generator-data", server.local_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    drop(socket);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn departed_subscribers_do_not_affect_the_rest() {
    let store: Arc<dyn SampleStore> = Arc::new(powerpulse_persistence::MemorySampleStore::new());
    let registry = SubscriberRegistry::new(16);
    let server = ServerBuilder::new(
        "127.0.0.1:0".parse().unwrap(),
        registry.clone(),
        store.clone(),
    )
    .spawn()
    .await
    .unwrap();
    let url = format!("ws://{}/ws", server.local_addr());

    let (mut leaving, _response) = connect_async(&url).await.unwrap();
    let (mut staying, _response) = connect_async(&url).await.unwrap();
    wait_for_subscribers(&registry, 2).await;

    leaving.close(None).await.unwrap();
    wait_for_subscribers(&registry, 1).await;

    let hub = DistributionHub::new(store, Arc::new(registry.clone()));
    let mut pipeline = IngestPipeline::new(SampleAccumulator::default(), hub);
    let outcome = pipeline.ingest(&event(1, "avg_voltage", "[229.5]")).await;
    assert!(matches!(
        outcome,
        IngestOutcome::Pending {
            source: SourceKind::Grid
        }
    ));

    let frame = next_text(&mut staying).await;
    assert_eq!(frame["stage"], "partial");
    assert_eq!(frame["data"]["avgVoltage"], json!(229.5));

    staying.send(WsMessage::Ping(vec![1, 2, 3])).await.unwrap();
    let pong = timeout(Duration::from_secs(2), staying.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(pong, WsMessage::Pong(_)));

    drop(staying);
    server.shutdown().await.unwrap();
}
