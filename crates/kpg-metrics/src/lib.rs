//! ---
//! kpg_section: "03-metrics"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Metrics collection and text exposition."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::error;

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in the registry using the Prometheus text format.
///
/// Returns the content type alongside the body so HTTP layers can forward it.
pub fn render(registry: &Registry) -> Result<(String, &'static str)> {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let body = encoder.encode_to_string(&families).map_err(|err| {
        error!(error = %err, "failed to encode metrics");
        err
    })?;
    Ok((body, prometheus::TEXT_FORMAT))
}

/// Outcome label attached to control plane operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl<T, E> From<&std::result::Result<T, E>> for Outcome {
    fn from(value: &std::result::Result<T, E>) -> Self {
        if value.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Metrics recorded by the control plane facade.
#[derive(Clone, Debug)]
pub struct ControlPlaneMetrics {
    operations: IntCounterVec,
    declared_brokers: IntGauge,
    resets: IntCounter,
    reset_seconds: Histogram,
}

impl ControlPlaneMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new(
                "kpg_operations_total",
                "Control plane operations by name and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let declared_brokers = IntGauge::with_opts(Opts::new(
            "kpg_declared_brokers",
            "Broker services declared in the orchestration description",
        ))?;
        registry.register(Box::new(declared_brokers.clone()))?;

        let resets = IntCounter::with_opts(Opts::new(
            "kpg_resets_total",
            "Number of completed environment resets",
        ))?;
        registry.register(Box::new(resets.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let reset_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "kpg_reset_duration_seconds",
                "Wall time spent in environment resets",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(reset_seconds.clone()))?;

        Ok(Self {
            operations,
            declared_brokers,
            resets,
            reset_seconds,
        })
    }

    pub fn record(&self, operation: &str, outcome: Outcome) {
        self.operations
            .with_label_values(&[operation, outcome.as_str()])
            .inc();
    }

    pub fn set_declared_brokers(&self, count: usize) {
        self.declared_brokers.set(count as i64);
    }

    pub fn observe_reset(&self, seconds: f64) {
        self.resets.inc();
        self.reset_seconds.observe(seconds);
    }
}

pub use prometheus;
