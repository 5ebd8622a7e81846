//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry data model and wire envelopes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PhaseTriple, SourceKind};

/// Complete, timestamped reading for one source.
///
/// Only produced once phase voltage, phase current, and power factor are all
/// known. Persisted once and broadcast once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedSample {
    /// Source the reading belongs to.
    #[serde(rename = "type")]
    pub source: SourceKind,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
    /// Phase voltages.
    pub voltage: PhaseTriple,
    /// Phase currents.
    pub current: PhaseTriple,
    /// Phase active power.
    #[serde(default)]
    pub active_power: PhaseTriple,
    /// Average power factor.
    pub power_factor: f64,
    /// Total harmonic distortion; no ingestion path populates it yet.
    #[serde(default)]
    pub thd: Option<f64>,
    /// Average voltage, meter-supplied or derived from the phases.
    #[serde(default)]
    pub avg_voltage: Option<f64>,
    /// Average current, always derived from the phases.
    #[serde(default)]
    pub avg_current: Option<f64>,
    /// Average active power, meter-supplied or derived from the phases.
    #[serde(default)]
    pub avg_active_power: Option<f64>,
}

impl FinishedSample {
    /// Sample-shaped wire record for this reading.
    pub fn to_record(&self) -> MeterRecord {
        MeterRecord::from(self)
    }
}

/// Sample-shaped record with every measurement nullable.
///
/// Used for partial previews on the subscriber transport and as the request
/// body accepted by the prediction test route.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterRecord {
    /// Source, when known.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    /// Phase voltages.
    #[serde(default)]
    pub voltage: PhaseTriple,
    /// Phase currents.
    #[serde(default)]
    pub current: PhaseTriple,
    /// Phase active power.
    #[serde(default)]
    pub active_power: PhaseTriple,
    /// Average voltage.
    #[serde(default)]
    pub avg_voltage: Option<f64>,
    /// Average current.
    #[serde(default)]
    pub avg_current: Option<f64>,
    /// Average active power.
    #[serde(default)]
    pub avg_active_power: Option<f64>,
    /// Average power factor.
    #[serde(default)]
    pub power_factor: Option<f64>,
    /// Total harmonic distortion.
    #[serde(default)]
    pub thd: Option<f64>,
    /// Record time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&FinishedSample> for MeterRecord {
    fn from(sample: &FinishedSample) -> Self {
        Self {
            source: Some(sample.source),
            voltage: sample.voltage,
            current: sample.current,
            active_power: sample.active_power,
            avg_voltage: sample.avg_voltage,
            avg_current: sample.avg_current,
            avg_active_power: sample.avg_active_power,
            power_factor: Some(sample.power_factor),
            thd: sample.thd,
            timestamp: Some(sample.timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> FinishedSample {
        FinishedSample {
            source: SourceKind::Grid,
            timestamp: "2026-01-02T03:04:05Z".parse().unwrap(),
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

    #[test]
    fn finished_sample_uses_dashboard_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], json!("grid"));
        assert_eq!(json["voltage"]["R"], json!(230.0));
        assert_eq!(json["powerFactor"], json!(0.95));
        assert_eq!(json["avgCurrent"], json!(10.0));
        assert_eq!(json["activePower"]["B"], serde_json::Value::Null);
        assert_eq!(json["thd"], serde_json::Value::Null);
    }

    #[test]
    fn record_mirrors_finished_sample() {
        let sample = sample();
        let record = sample.to_record();
        assert_eq!(record.source, Some(SourceKind::Grid));
        assert_eq!(record.power_factor, Some(0.95));
        assert_eq!(record.timestamp, Some(sample.timestamp));
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::to_value(&sample).unwrap()
        );
    }

    #[test]
    fn sparse_record_bodies_deserialise() {
        let record: MeterRecord =
            serde_json::from_value(json!({"voltage": {"R": 231.0}, "thd": 3.5})).unwrap();
        assert_eq!(record.voltage.r, Some(231.0));
        assert_eq!(record.voltage.y, None);
        assert_eq!(record.thd, Some(3.5));
        assert!(record.source.is_none());
    }
}
