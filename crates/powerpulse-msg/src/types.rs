//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry data model and wire envelopes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telemetry origin. Each source is accumulated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Utility grid meter (device identifier `1`).
    Grid,
    /// Generator meter (device identifier `2`).
    Generator,
}

impl SourceKind {
    /// Every known source, in device identifier order.
    pub const ALL: [SourceKind; 2] = [SourceKind::Grid, SourceKind::Generator];

    /// Map a numeric device identifier onto a source. Unknown identifiers are unroutable.
    pub fn from_device_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(SourceKind::Grid),
            2 => Some(SourceKind::Generator),
            _ => None,
        }
    }

    /// Stable lowercase label used on the wire, in metrics, and in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Grid => "grid",
            SourceKind::Generator => "generator",
        }
    }

    /// Dense index used for fixed-size per-source tables.
    pub fn index(&self) -> usize {
        match self {
            SourceKind::Grid => 0,
            SourceKind::Generator => 1,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grid" => Ok(SourceKind::Grid),
            "generator" => Ok(SourceKind::Generator),
            other => Err(format!("unknown source: {}", other)),
        }
    }
}

/// Classification of a named measurement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Per-phase voltage triple.
    PhaseVoltage,
    /// Per-phase current triple.
    PhaseCurrent,
    /// Per-phase active power triple.
    PhaseActivePower,
    /// Scalar average power factor.
    AveragePowerFactor,
    /// Scalar average voltage supplied by the meter.
    AverageVoltage,
    /// Scalar average active power supplied by the meter.
    AverageActivePower,
    /// Field name did not match any known measurement.
    Unrecognized,
}

impl FieldKind {
    /// Stable label for metrics and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::PhaseVoltage => "phase_voltage",
            FieldKind::PhaseCurrent => "phase_current",
            FieldKind::PhaseActivePower => "phase_active_power",
            FieldKind::AveragePowerFactor => "average_power_factor",
            FieldKind::AverageVoltage => "average_voltage",
            FieldKind::AverageActivePower => "average_active_power",
            FieldKind::Unrecognized => "unrecognized",
        }
    }
}

/// Three-phase value set. Each phase is independently nullable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseTriple {
    /// Red phase.
    #[serde(rename = "R", default)]
    pub r: Option<f64>,
    /// Yellow phase.
    #[serde(rename = "Y", default)]
    pub y: Option<f64>,
    /// Blue phase.
    #[serde(rename = "B", default)]
    pub b: Option<f64>,
}

impl PhaseTriple {
    /// Construct a fully populated triple.
    pub fn new(r: f64, y: f64, b: f64) -> Self {
        Self {
            r: Some(r),
            y: Some(y),
            b: Some(b),
        }
    }

    /// Take the first three values as (R, Y, B); missing positions stay null.
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            r: values.first().copied(),
            y: values.get(1).copied(),
            b: values.get(2).copied(),
        }
    }

    /// Phases in R, Y, B order.
    pub fn phases(&self) -> [Option<f64>; 3] {
        [self.r, self.y, self.b]
    }

    /// True when all three phases carry a value.
    pub fn is_complete(&self) -> bool {
        self.phases().iter().all(Option::is_some)
    }

    /// True when at least one phase carries a value.
    pub fn any(&self) -> bool {
        self.phases().iter().any(Option::is_some)
    }

    /// Arithmetic mean of the populated phases; `None` when every phase is null.
    pub fn mean(&self) -> Option<f64> {
        let valid: Vec<f64> = self
            .phases()
            .into_iter()
            .flatten()
            .filter(|value| !value.is_nan())
            .collect();
        if valid.is_empty() {
            return None;
        }
        Some(valid.iter().sum::<f64>() / valid.len() as f64)
    }
}

/// Typed value carried by one decoded fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Phase voltages.
    PhaseVoltage(PhaseTriple),
    /// Phase currents.
    PhaseCurrent(PhaseTriple),
    /// Phase active power.
    PhaseActivePower(PhaseTriple),
    /// Average power factor.
    PowerFactor(f64),
    /// Meter-supplied average voltage.
    AverageVoltage(f64),
    /// Meter-supplied average active power.
    AverageActivePower(f64),
}

impl Reading {
    /// Build the reading for a recognised field from the parsed payload numbers.
    ///
    /// Returns `None` for [`FieldKind::Unrecognized`]; such fields never carry values.
    pub fn from_values(field: FieldKind, values: &[f64]) -> Option<Self> {
        let scalar = values.first().copied();
        match field {
            FieldKind::PhaseVoltage => Some(Reading::PhaseVoltage(PhaseTriple::from_values(values))),
            FieldKind::PhaseCurrent => Some(Reading::PhaseCurrent(PhaseTriple::from_values(values))),
            FieldKind::PhaseActivePower => {
                Some(Reading::PhaseActivePower(PhaseTriple::from_values(values)))
            }
            FieldKind::AveragePowerFactor => scalar.map(Reading::PowerFactor),
            FieldKind::AverageVoltage => scalar.map(Reading::AverageVoltage),
            FieldKind::AverageActivePower => scalar.map(Reading::AverageActivePower),
            FieldKind::Unrecognized => None,
        }
    }

    /// Field classification of this reading.
    pub fn field(&self) -> FieldKind {
        match self {
            Reading::PhaseVoltage(_) => FieldKind::PhaseVoltage,
            Reading::PhaseCurrent(_) => FieldKind::PhaseCurrent,
            Reading::PhaseActivePower(_) => FieldKind::PhaseActivePower,
            Reading::PowerFactor(_) => FieldKind::AveragePowerFactor,
            Reading::AverageVoltage(_) => FieldKind::AverageVoltage,
            Reading::AverageActivePower(_) => FieldKind::AverageActivePower,
        }
    }
}

/// One decoded field update for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Source the update belongs to.
    pub source: SourceKind,
    /// Decoded value.
    pub reading: Reading,
    /// Arrival time of the raw event.
    pub received_at: DateTime<Utc>,
}

impl Fragment {
    /// Construct a fragment stamped with the current time.
    pub fn new(source: SourceKind, reading: Reading) -> Self {
        Self {
            source,
            reading,
            received_at: Utc::now(),
        }
    }

    /// Field classification of the carried reading.
    pub fn field(&self) -> FieldKind {
        self.reading.field()
    }
}
