//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry field decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Stateless decoding of raw meter events into typed fragments.

use powerpulse_msg::{FieldKind, Fragment, RawEvent, Reading, SourceKind};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Reasons a raw event is dropped before reaching the accumulator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Event body is not an object of the expected shape.
    #[error("malformed telemetry event: {0}")]
    Malformed(String),
    /// The `Powerpulse` wrapper is absent.
    #[error("telemetry event has no Powerpulse envelope")]
    MissingEnvelope,
    /// The payload string is absent or empty.
    #[error("telemetry event has no data payload")]
    MissingPayload,
    /// Device identifier maps to neither grid nor generator.
    #[error("unroutable device id {0:?}")]
    UnknownSource(Option<i64>),
    /// Field label matched no known measurement.
    #[error("unrecognized field {name:?} (addr={addr})")]
    UnrecognizedField {
        /// Field label as received.
        name: String,
        /// Register address as received.
        addr: String,
    },
}

/// Classify a field label. First match wins; the order matters because
/// several labels contain one another.
pub fn classify(name: &str, source: SourceKind) -> FieldKind {
    let lower = name.to_lowercase();
    let phase_voltage = match source {
        SourceKind::Generator => lower == "voltage",
        SourceKind::Grid => lower.contains("voltage1"),
    };

    if phase_voltage {
        FieldKind::PhaseVoltage
    } else if lower.contains("avg_voltage") {
        FieldKind::AverageVoltage
    } else if lower.contains("ryb_current") {
        FieldKind::PhaseCurrent
    } else if lower.contains("avg_pf") {
        FieldKind::AveragePowerFactor
    } else if lower.contains("ryb_activepower") {
        FieldKind::PhaseActivePower
    } else if lower.contains("avg_activepower") {
        FieldKind::AverageActivePower
    } else {
        FieldKind::Unrecognized
    }
}

/// Result alias for decoding raw events.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Parse a `[a, b, c]` style payload. Each token contributes its longest
/// leading decimal number (`"230.1V"` reads as 230.1); a token with no such
/// prefix, or whose value is not finite, becomes `0`.
pub fn parse_values(data: &str) -> Vec<f64> {
    data.replace(['[', ']'], "")
        .split(',')
        .map(leading_number)
        .collect()
}

fn leading_number(token: &str) -> f64 {
    let token = token.trim_start();
    let bytes = token.as_bytes();
    let digits_from = |mut at: usize| {
        while bytes.get(at).is_some_and(u8::is_ascii_digit) {
            at += 1;
        }
        at
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;
    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - end - 1;
        if mantissa_digits > 0 {
            end = frac_end;
        }
    }
    if mantissa_digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(bytes.get(end + 1), Some(b'+' | b'-')));
        let exp_end = digits_from(end + 1 + sign);
        if exp_end > end + 1 + sign {
            end = exp_end;
        }
    }

    match token[..end].parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => 0.0,
    }
}

/// Decode one raw event.
pub fn decode(event: &Value) -> Result<Fragment> {
    let raw = RawEvent::deserialize(event).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let payload = raw.powerpulse.ok_or(DecodeError::MissingEnvelope)?;
    let data = payload
        .data
        .as_deref()
        .filter(|data| !data.is_empty())
        .ok_or(DecodeError::MissingPayload)?;

    let device = payload.device_id();
    let source = device
        .and_then(SourceKind::from_device_id)
        .ok_or(DecodeError::UnknownSource(device))?;

    let name = payload.field_name();
    let field = classify(name, source);
    let values = parse_values(data);
    match Reading::from_values(field, &values) {
        Some(reading) => Ok(Fragment::new(source, reading)),
        None => {
            let addr = payload.addr_label();
            warn!(field = name, addr = %addr, source = %source, "unrecognized entry ignored");
            Err(DecodeError::UnrecognizedField {
                name: name.to_owned(),
                addr,
            })
        }
    }
}
