//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry normalization and accumulation engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Turns raw, partial meter events into complete samples and hands them to
//! storage and live subscribers.
#![warn(missing_docs)]

pub mod accumulator;
pub mod decoder;
pub mod hub;
pub mod metrics;
pub mod pipeline;
pub mod source;

pub use accumulator::{preview, PartialSample, SampleAccumulator};
pub use decoder::{classify, decode, parse_values, DecodeError, Result};
pub use hub::{DistributionHub, IngestOutcome};
pub use metrics::IngestMetrics;
pub use pipeline::{IngestPipeline, IngestSummary};
pub use source::{ChannelSource, JsonLinesSource, TelemetrySource};
