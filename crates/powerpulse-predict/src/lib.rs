//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Anomaly-prediction collaborator client."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Client for the external anomaly-prediction service.
//!
//! Both calls are best-effort: transport, status, and decoding failures are
//! logged and replaced with an "unknown" sentinel so callers never fail on an
//! absent prediction.
#![warn(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use powerpulse_msg::MeterRecord;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Errors raised while talking to the prediction service.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    /// Base URL could not be parsed or joined.
    #[error("invalid prediction url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Transport or decoding failure.
    #[error("prediction request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Service answered with a non-success status.
    #[error("prediction service returned status {0}")]
    Status(u16),
}

/// Result alias for prediction client calls.
pub type Result<T> = std::result::Result<T, PredictionError>;

/// Payload accepted by `POST /predict`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictRequest {
    #[serde(rename = "voltage_R")]
    voltage_r: f64,
    #[serde(rename = "voltage_Y")]
    voltage_y: f64,
    #[serde(rename = "voltage_B")]
    voltage_b: f64,
    #[serde(rename = "current_R")]
    current_r: f64,
    #[serde(rename = "current_Y")]
    current_y: f64,
    #[serde(rename = "current_B")]
    current_b: f64,
    #[serde(rename = "activePower")]
    active_power: f64,
    #[serde(rename = "powerFactor")]
    power_factor: f64,
    thd: f64,
}

impl From<&MeterRecord> for PredictRequest {
    fn from(record: &MeterRecord) -> Self {
        let active_power = record
            .avg_active_power
            .or_else(|| record.active_power.mean())
            .unwrap_or(0.0);
        Self {
            voltage_r: record.voltage.r.unwrap_or(0.0),
            voltage_y: record.voltage.y.unwrap_or(0.0),
            voltage_b: record.voltage.b.unwrap_or(0.0),
            current_r: record.current.r.unwrap_or(0.0),
            current_y: record.current.y.unwrap_or(0.0),
            current_b: record.current.b.unwrap_or(0.0),
            active_power,
            power_factor: record.power_factor.unwrap_or(1.0),
            thd: record.thd.unwrap_or(0.0),
        }
    }
}

/// Payload accepted by `POST /detect_thd`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThdRequest {
    thd: f64,
    #[serde(rename = "voltage_R")]
    voltage_r: f64,
    #[serde(rename = "voltage_Y")]
    voltage_y: f64,
    #[serde(rename = "voltage_B")]
    voltage_b: f64,
}

impl From<&MeterRecord> for ThdRequest {
    fn from(record: &MeterRecord) -> Self {
        Self {
            thd: record.thd.unwrap_or(0.0),
            voltage_r: record.voltage.r.unwrap_or(0.0),
            voltage_y: record.voltage.y.unwrap_or(0.0),
            voltage_b: record.voltage.b.unwrap_or(0.0),
        }
    }
}

/// Anomaly verdict and predicted active power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// `None` when the service could not be reached.
    #[serde(default, deserialize_with = "lenient_flag")]
    pub is_anomaly: Option<bool>,
    /// `None` when the service could not be reached.
    #[serde(rename = "predicted_activePower", default)]
    pub predicted_active_power: Option<f64>,
}

impl Prediction {
    /// Sentinel returned when the prediction is unavailable.
    pub fn unknown() -> Self {
        Self {
            is_anomaly: None,
            predicted_active_power: None,
        }
    }
}

/// THD anomaly verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThdAssessment {
    /// Whether the harmonic distortion is anomalous.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_thd_anomaly: bool,
    /// Whether a configured THD threshold was crossed.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub threshold_violation: bool,
    /// Free-form detail from the service; `"Error"` on the sentinel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ThdAssessment {
    /// Sentinel returned when the assessment is unavailable.
    pub fn unknown() -> Self {
        Self {
            is_thd_anomaly: false,
            threshold_violation: false,
            message: Some("Error".to_owned()),
        }
    }
}

/// Accepts `true`/`false`, `0`/`1`, or `null`.
fn lenient_flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(flag) => Some(flag),
        serde_json::Value::Number(number) => number.as_f64().map(|n| n != 0.0),
        _ => None,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_flag(deserializer)?.unwrap_or(false))
}

/// Prediction collaborator as seen by the rest of the service.
#[async_trait]
pub trait PredictionService: Send + Sync + 'static {
    /// Anomaly flag and predicted active power for a record.
    async fn predict(&self, record: &MeterRecord) -> Prediction;

    /// THD anomaly and threshold-violation flags for a record.
    async fn detect_thd(&self, record: &MeterRecord) -> ThdAssessment;
}

/// HTTP client for the prediction service.
#[derive(Debug, Clone)]
pub struct PredictionClient {
    http: reqwest::Client,
    predict_url: Url,
    thd_url: Url,
}

impl PredictionClient {
    /// Build a client rooted at `base_url` (e.g. `http://localhost:8083`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            predict_url: base.join("predict")?,
            thd_url: base.join("detect_thd")?,
        })
    }

    /// Call `/predict`, surfacing failures.
    pub async fn try_predict(&self, record: &MeterRecord) -> Result<Prediction> {
        self.post(&self.predict_url, &PredictRequest::from(record))
            .await
    }

    /// Call `/detect_thd`, surfacing failures.
    pub async fn try_detect_thd(
        &self,
        record: &MeterRecord,
    ) -> Result<ThdAssessment> {
        self.post(&self.thd_url, &ThdRequest::from(record)).await
    }

    async fn post<B, T>(&self, url: &Url, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let response = self.http.post(url.clone()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PredictionError::Status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PredictionService for PredictionClient {
    async fn predict(&self, record: &MeterRecord) -> Prediction {
        match self.try_predict(record).await {
            Ok(prediction) => {
                debug!(?prediction, "prediction received");
                prediction
            }
            Err(err) => {
                warn!(error = %err, "prediction unavailable");
                Prediction::unknown()
            }
        }
    }

    async fn detect_thd(&self, record: &MeterRecord) -> ThdAssessment {
        match self.try_detect_thd(record).await {
            Ok(assessment) => {
                debug!(?assessment, "thd assessment received");
                assessment
            }
            Err(err) => {
                warn!(error = %err, "thd assessment unavailable");
                ThdAssessment::unknown()
            }
        }
    }
}
