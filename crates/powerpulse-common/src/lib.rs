//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the PowerPulse workspace: configuration loading and
//! tracing initialisation.

pub mod config;
pub mod logging;

pub use config::{
    load_env_file, AccumulatorConfig, AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    PredictionConfig, ServerConfig, StoreBackend, StoreConfig, StreamConfig,
};
pub use logging::{init_tracing, LogFormat};
