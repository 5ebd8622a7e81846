//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use powerpulse_msg::{MeterRecord, SourceKind};
use powerpulse_predict::{Prediction, ThdAssessment};
use prometheus::TextEncoder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::server::AppState;

/// Response of `POST /api/test-ml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionReport {
    /// Anomaly verdict from `/predict`.
    pub ml_result: Prediction,
    /// THD verdict from `/detect_thd`.
    pub thd_result: ThdAssessment,
}

pub(crate) async fn get_grid_data(State(state): State<Arc<AppState>>) -> Response {
    history(&state, SourceKind::Grid).await
}

pub(crate) async fn get_generator_data(State(state): State<Arc<AppState>>) -> Response {
    history(&state, SourceKind::Generator).await
}

async fn history(state: &AppState, source: SourceKind) -> Response {
    match state.store.recent(Some(source), state.history_limit).await {
        Ok(samples) => Json(samples).into_response(),
        Err(err) => {
            error!(source = %source, error = %err, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": format!("Error fetching {source} data") })),
            )
                .into_response()
        }
    }
}

pub(crate) async fn post_test_ml(
    State(state): State<Arc<AppState>>,
    Json(record): Json<MeterRecord>,
) -> Response {
    let Some(prediction) = &state.prediction else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "prediction service disabled" })),
        )
            .into_response();
    };

    let (ml_result, thd_result) =
        tokio::join!(prediction.predict(&record), prediction.detect_thd(&record));
    Json(PredictionReport {
        ml_result,
        thd_result,
    })
    .into_response()
}

pub(crate) async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };

    let encoder = TextEncoder::new();
    let families = registry.gather();
    match encoder.encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
