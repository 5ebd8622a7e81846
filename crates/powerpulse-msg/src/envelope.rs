//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry data model and wire envelopes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::sample::{FinishedSample, MeterRecord};
use crate::Result;

/// Message type tag carried by every outbound envelope.
pub const IOT_MESSAGE_TYPE: &str = "iot";

/// Inbound telemetry event as delivered by the stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEvent {
    /// Envelope wrapper; events without it are rejected.
    #[serde(rename = "Powerpulse", default)]
    pub powerpulse: Option<RawPayload>,
}

/// Payload nested inside the inbound envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPayload {
    /// Device identifier; a JSON number or a numeric string.
    #[serde(default)]
    pub server_id: Option<JsonValue>,
    /// Device register address, kept for diagnostics only.
    #[serde(default)]
    pub addr: Option<JsonValue>,
    /// Field label.
    #[serde(default)]
    pub name: Option<String>,
    /// Comma/bracket-delimited numeric string, e.g. `"[230.1, 229.8, 231.0]"`.
    #[serde(default)]
    pub data: Option<String>,
}

impl RawPayload {
    /// Numeric device identifier, accepting integral numbers and numeric strings.
    pub fn device_id(&self) -> Option<i64> {
        let value = self.server_id.as_ref()?;
        let numeric = match value {
            JsonValue::Number(number) => number.as_f64()?,
            JsonValue::String(text) => text.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if numeric.fract() != 0.0 || !numeric.is_finite() {
            return None;
        }
        Some(numeric as i64)
    }

    /// Field label, empty when absent.
    pub fn field_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Register address rendered for log output.
    pub fn addr_label(&self) -> String {
        match &self.addr {
            Some(JsonValue::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::from("-"),
        }
    }
}

/// Whether an outbound update is a single-field preview or a finished sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStage {
    /// One fragment, broadcast before completeness is known.
    Partial,
    /// A finished sample that has been handed to persistence.
    Complete,
}

/// Envelope broadcast to live subscribers: `{"type": "iot", "stage": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Always [`IOT_MESSAGE_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Partial preview or complete sample.
    pub stage: UpdateStage,
    /// Sample-shaped payload.
    pub data: MeterRecord,
}

impl OutboundMessage {
    /// Wrap a fragment preview.
    pub fn partial(record: MeterRecord) -> Self {
        Self {
            kind: IOT_MESSAGE_TYPE.to_owned(),
            stage: UpdateStage::Partial,
            data: record,
        }
    }

    /// Wrap a finished sample.
    pub fn complete(sample: &FinishedSample) -> Self {
        Self {
            kind: IOT_MESSAGE_TYPE.to_owned(),
            stage: UpdateStage::Complete,
            data: sample.to_record(),
        }
    }

    /// Encode as JSON text for the subscriber transport.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
