//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry data model and wire envelopes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Canonical telemetry types shared by the ingestion engine, storage, and
//! the subscriber transport.
#![warn(missing_docs)]

pub mod envelope;
pub mod sample;
pub mod types;

/// Shared result type for message encoding operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while encoding or decoding wire envelopes.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use envelope::{OutboundMessage, RawEvent, RawPayload, UpdateStage, IOT_MESSAGE_TYPE};
pub use sample::{FinishedSample, MeterRecord};
pub use types::{FieldKind, Fragment, PhaseTriple, Reading, SourceKind};
