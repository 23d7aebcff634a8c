//! ---
//! kpg_section: "02-configuration-logging"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Shared primitives for the control plane workspace."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
//! Shared primitives for the Kafka playground control plane.
//! This crate exposes configuration loading and tracing setup consumed
//! across the workspace.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, ClusterConfig, EndpointStyle, LoadedAppConfig, LoggingConfig,
    MetricsConfig, ResetConfig, RuntimeConfig, RuntimeMode, TopicsConfig,
};
pub use logging::{init_tracing, LogFormat};

/// Identifier of the cluster that always exists.
pub const DEFAULT_CLUSTER_ID: &str = "default";
