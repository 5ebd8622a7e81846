//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-source sample accumulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Folds fragments into complete samples, one independent slot per source.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use powerpulse_msg::{FinishedSample, Fragment, MeterRecord, PhaseTriple, Reading, SourceKind};
use tracing::debug;

/// In-progress state for one source.
///
/// `avg_voltage` and `avg_active_power` hold only meter-supplied values; the
/// effective averages fall back to the phase mean at read time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialSample {
    /// Phase voltages.
    pub voltage: PhaseTriple,
    /// Phase currents.
    pub current: PhaseTriple,
    /// Phase active power.
    pub active_power: PhaseTriple,
    /// Average power factor.
    pub power_factor: Option<f64>,
    /// Meter-supplied average voltage.
    pub avg_voltage: Option<f64>,
    /// Meter-supplied average active power.
    pub avg_active_power: Option<f64>,
}

impl PartialSample {
    /// Overwrite the field carried by `reading`.
    pub fn merge(&mut self, reading: &Reading) {
        match *reading {
            Reading::PhaseVoltage(triple) => self.voltage = triple,
            Reading::PhaseCurrent(triple) => self.current = triple,
            Reading::PhaseActivePower(triple) => self.active_power = triple,
            Reading::PowerFactor(value) => self.power_factor = Some(value),
            Reading::AverageVoltage(value) => self.avg_voltage = Some(value),
            Reading::AverageActivePower(value) => self.avg_active_power = Some(value),
        }
    }

    /// Supplied average voltage, else the mean of the populated phases.
    pub fn effective_avg_voltage(&self) -> Option<f64> {
        self.avg_voltage.or_else(|| self.voltage.mean())
    }

    /// Supplied average active power, else the mean of the populated phases.
    pub fn effective_avg_active_power(&self) -> Option<f64> {
        self.avg_active_power.or_else(|| self.active_power.mean())
    }

    /// Always derived from the phase currents.
    pub fn avg_current(&self) -> Option<f64> {
        self.current.mean()
    }

    /// All phase voltages, all phase currents, and the power factor are present.
    pub fn is_complete(&self) -> bool {
        self.voltage.is_complete() && self.current.is_complete() && self.power_factor.is_some()
    }

    /// Nothing has been merged yet.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Sample-shaped view of the current state.
    pub fn to_record(&self, source: SourceKind, timestamp: DateTime<Utc>) -> MeterRecord {
        MeterRecord {
            source: Some(source),
            voltage: self.voltage,
            current: self.current,
            active_power: self.active_power,
            avg_voltage: self.effective_avg_voltage(),
            avg_current: self.avg_current(),
            avg_active_power: self.effective_avg_active_power(),
            power_factor: self.power_factor,
            thd: None,
            timestamp: Some(timestamp),
        }
    }

    fn finish(&self, source: SourceKind, timestamp: DateTime<Utc>) -> Option<FinishedSample> {
        if !self.is_complete() {
            return None;
        }
        Some(FinishedSample {
            source,
            timestamp,
            voltage: self.voltage,
            current: self.current,
            active_power: self.active_power,
            power_factor: self.power_factor?,
            thd: None,
            avg_voltage: self.effective_avg_voltage(),
            avg_current: self.avg_current(),
            avg_active_power: self.effective_avg_active_power(),
        })
    }
}

#[derive(Debug, Default)]
struct Slot {
    sample: PartialSample,
    started_at: Option<DateTime<Utc>>,
}

/// Owner of the two per-source accumulation slots.
#[derive(Debug, Default)]
pub struct SampleAccumulator {
    slots: [Slot; 2],
    max_pending_age: Option<TimeDelta>,
}

impl SampleAccumulator {
    /// Create an accumulator. With `max_pending_age` set, a partial sample
    /// older than the limit is discarded before the next merge.
    pub fn new(max_pending_age: Option<Duration>) -> Self {
        Self {
            slots: Default::default(),
            max_pending_age: max_pending_age.and_then(|age| TimeDelta::from_std(age).ok()),
        }
    }

    /// Merge a fragment, stamping completion with the current time.
    pub fn accumulate(&mut self, fragment: &Fragment) -> Option<FinishedSample> {
        self.accumulate_at(fragment, Utc::now())
    }

    /// Merge a fragment at an explicit instant.
    pub fn accumulate_at(
        &mut self,
        fragment: &Fragment,
        now: DateTime<Utc>,
    ) -> Option<FinishedSample> {
        let source = fragment.source;
        let max_age = self.max_pending_age;
        let slot = &mut self.slots[source.index()];

        if let (Some(max_age), Some(started_at)) = (max_age, slot.started_at) {
            if now - started_at > max_age {
                debug!(source = %source, started_at = %started_at, "discarding stale partial sample");
                *slot = Slot::default();
            }
        }

        slot.started_at.get_or_insert(now);
        slot.sample.merge(&fragment.reading);

        let finished = slot.sample.finish(source, now)?;
        *slot = Slot::default();
        debug!(source = %source, "sample completed");
        Some(finished)
    }

    /// Pending state for `source`; empty right after a completion.
    pub fn pending(&self, source: SourceKind) -> &PartialSample {
        &self.slots[source.index()].sample
    }
}

/// Sample-shaped record built from one fragment alone.
pub fn preview(fragment: &Fragment) -> MeterRecord {
    let mut sample = PartialSample::default();
    sample.merge(&fragment.reading);
    sample.to_record(fragment.source, fragment.received_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(source: SourceKind, reading: Reading) -> Fragment {
        Fragment::new(source, reading)
    }

    fn voltage(r: f64, y: f64, b: f64) -> Reading {
        Reading::PhaseVoltage(PhaseTriple::new(r, y, b))
    }

    fn current(r: f64, y: f64, b: f64) -> Reading {
        Reading::PhaseCurrent(PhaseTriple::new(r, y, b))
    }

    #[test]
    fn grid_scenario_completes_once_and_resets() {
        let mut acc = SampleAccumulator::default();
        let grid = SourceKind::Grid;

        assert!(acc.accumulate(&fragment(grid, voltage(230.0, 231.0, 229.0))).is_none());
        assert!(acc.accumulate(&fragment(grid, current(10.0, 11.0, 9.0))).is_none());
        let sample = acc
            .accumulate(&fragment(grid, Reading::PowerFactor(0.95)))
            .unwrap();

        assert_eq!(sample.source, grid);
        assert!((sample.avg_voltage.unwrap() - 230.0).abs() < 1e-9);
        assert!((sample.avg_current.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(sample.power_factor, 0.95);
        assert_eq!(sample.avg_active_power, None);
        assert_eq!(sample.thd, None);
        assert!(acc.pending(grid).is_empty());
    }

    #[test]
    fn gating_requires_every_mandatory_field() {
        let mut acc = SampleAccumulator::default();
        let grid = SourceKind::Grid;
        let partial_voltage = Reading::PhaseVoltage(PhaseTriple {
            r: Some(230.0),
            y: Some(231.0),
            b: None,
        });

        assert!(acc.accumulate(&fragment(grid, partial_voltage)).is_none());
        assert!(acc.accumulate(&fragment(grid, current(10.0, 11.0, 9.0))).is_none());
        assert!(acc
            .accumulate(&fragment(grid, Reading::PowerFactor(0.9)))
            .is_none());
        assert!(acc
            .accumulate(&fragment(grid, Reading::AverageVoltage(230.0)))
            .is_none());
        assert!(!acc.pending(grid).is_empty());

        let sample = acc
            .accumulate(&fragment(grid, voltage(230.0, 231.0, 229.0)))
            .unwrap();
        assert_eq!(sample.avg_voltage, Some(230.0));
    }

    #[test]
    fn averages_ignore_null_phases() {
        let mut sample = PartialSample::default();
        sample.merge(&Reading::PhaseVoltage(PhaseTriple {
            r: Some(100.0),
            y: None,
            b: Some(102.0),
        }));
        assert_eq!(sample.effective_avg_voltage(), Some(101.0));

        sample.merge(&Reading::PhaseVoltage(PhaseTriple::default()));
        assert_eq!(sample.effective_avg_voltage(), None);
    }

    #[test]
    fn supplied_averages_win_except_for_current() {
        let mut sample = PartialSample::default();
        sample.merge(&voltage(230.0, 230.0, 230.0));
        sample.merge(&Reading::AverageVoltage(228.5));
        sample.merge(&Reading::PhaseActivePower(PhaseTriple::new(1.0, 2.0, 3.0)));
        assert_eq!(sample.effective_avg_voltage(), Some(228.5));
        assert_eq!(sample.effective_avg_active_power(), Some(2.0));

        sample.merge(&current(10.0, 10.0, 10.0));
        assert_eq!(sample.avg_current(), Some(10.0));
        sample.merge(&current(20.0, 20.0, 20.0));
        assert_eq!(sample.avg_current(), Some(20.0));
    }

    #[test]
    fn sources_never_share_state() {
        let mut acc = SampleAccumulator::default();
        let grid = SourceKind::Grid;
        let generator = SourceKind::Generator;

        acc.accumulate(&fragment(grid, voltage(230.0, 231.0, 229.0)));
        acc.accumulate(&fragment(generator, current(20.0, 21.0, 19.0)));
        acc.accumulate(&fragment(grid, Reading::PowerFactor(0.95)));
        acc.accumulate(&fragment(generator, voltage(415.0, 414.0, 416.0)));

        assert_eq!(acc.pending(grid).current, PhaseTriple::default());
        assert_eq!(acc.pending(generator).power_factor, None);
        assert_eq!(acc.pending(generator).voltage, PhaseTriple::new(415.0, 414.0, 416.0));

        let generator_sample = acc
            .accumulate(&fragment(generator, Reading::PowerFactor(0.8)))
            .unwrap();
        assert_eq!(generator_sample.source, generator);
        assert!(acc.pending(generator).is_empty());
        assert_eq!(acc.pending(grid).power_factor, Some(0.95));
    }

    #[test]
    fn timestamp_is_assigned_at_completion() {
        let mut acc = SampleAccumulator::default();
        let grid = SourceKind::Grid;
        let start: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let end = start + TimeDelta::seconds(30);

        acc.accumulate_at(&fragment(grid, voltage(1.0, 1.0, 1.0)), start);
        acc.accumulate_at(&fragment(grid, current(1.0, 1.0, 1.0)), start);
        let sample = acc
            .accumulate_at(&fragment(grid, Reading::PowerFactor(1.0)), end)
            .unwrap();
        assert_eq!(sample.timestamp, end);
    }

    #[test]
    fn stale_partials_are_discarded_when_configured() {
        let grid = SourceKind::Grid;
        let start: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let late = start + TimeDelta::seconds(120);

        let mut bounded = SampleAccumulator::new(Some(Duration::from_secs(60)));
        bounded.accumulate_at(&fragment(grid, voltage(1.0, 1.0, 1.0)), start);
        bounded.accumulate_at(&fragment(grid, current(1.0, 1.0, 1.0)), start);
        assert!(bounded
            .accumulate_at(&fragment(grid, Reading::PowerFactor(1.0)), late)
            .is_none());
        assert_eq!(bounded.pending(grid).power_factor, Some(1.0));
        assert_eq!(bounded.pending(grid).voltage, PhaseTriple::default());

        let mut unbounded = SampleAccumulator::new(None);
        unbounded.accumulate_at(&fragment(grid, voltage(1.0, 1.0, 1.0)), start);
        unbounded.accumulate_at(&fragment(grid, current(1.0, 1.0, 1.0)), start);
        assert!(unbounded
            .accumulate_at(&fragment(grid, Reading::PowerFactor(1.0)), late)
            .is_some());
    }

    #[test]
    fn preview_carries_only_the_fragment() {
        let record = preview(&fragment(
            SourceKind::Generator,
            Reading::PhaseCurrent(PhaseTriple::new(4.0, 5.0, 6.0)),
        ));
        assert_eq!(record.source, Some(SourceKind::Generator));
        assert_eq!(record.avg_current, Some(5.0));
        assert_eq!(record.avg_voltage, None);
        assert_eq!(record.power_factor, None);
        assert!(record.timestamp.is_some());
    }
}
