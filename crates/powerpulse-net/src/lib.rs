//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Real-time subscriber fan-out and the HTTP surface around it.
#![warn(missing_docs)]

pub mod registry;
pub mod rest;
pub mod server;
mod websocket;

pub use registry::{Broadcast, SubscriberId, SubscriberRegistry, Subscription, TransportMetrics};
pub use rest::PredictionReport;
pub use server::{ServerBuilder, ServerHandle, DEFAULT_HISTORY_LIMIT};
