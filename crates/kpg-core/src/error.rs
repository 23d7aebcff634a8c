//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Error taxonomy shared by every control plane component."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::fmt;

use serde::Serialize;

use crate::runtime::RuntimeError;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Individual steps of the broker provisioning and removal sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    PersistDescription,
    RequestStart,
    Inspect,
    Stop,
    RemoveContainer,
    RemoveDeclaration,
    RemoveVolume,
}

impl LifecycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStep::PersistDescription => "persist description",
            LifecycleStep::RequestStart => "request start",
            LifecycleStep::Inspect => "inspect",
            LifecycleStep::Stop => "stop",
            LifecycleStep::RemoveContainer => "remove container",
            LifecycleStep::RemoveDeclaration => "remove declaration",
            LifecycleStep::RemoveVolume => "remove volume",
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broker that a cluster delete could not remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerFailure {
    pub broker: String,
    pub error: String,
}

fn describe_failures(failures: &[BrokerFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.broker, failure.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors surfaced by control plane operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("cluster '{0}' already exists")]
    DuplicateCluster(String),
    #[error("invalid cluster name '{name}': {reason}")]
    InvalidClusterName { name: String, reason: &'static str },
    #[error("invalid topic spec: {0}")]
    InvalidTopicSpec(String),
    #[error("the default cluster cannot be deleted")]
    CannotDeleteDefault,
    #[error("no free broker port among {limit} candidates starting at {base}")]
    PortSpaceExhausted { base: u16, limit: u16 },
    #[error("orchestration description is malformed: {0}")]
    MalformedDescription(String),
    #[error("no running broker reachable for cluster '{0}'")]
    AdminUnreachable(String),
    #[error("topic '{0}' already exists")]
    TopicAlreadyExists(String),
    #[error("{step} of broker '{broker}' failed: {source}")]
    StepFailed {
        step: LifecycleStep,
        broker: String,
        source: Box<ControlPlaneError>,
    },
    #[error("cluster '{cluster}' was not deleted; brokers left behind: {}", describe_failures(.failed))]
    CascadeIncomplete {
        cluster: String,
        failed: Vec<BrokerFailure>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlPlaneError {
    /// Wrap an error with the lifecycle step and broker it occurred on.
    pub fn at_step(self, step: LifecycleStep, broker: impl Into<String>) -> Self {
        ControlPlaneError::StepFailed {
            step,
            broker: broker.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through [`ControlPlaneError::StepFailed`].
    pub fn root(&self) -> &ControlPlaneError {
        match self {
            ControlPlaneError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            ControlPlaneError::RuntimeUnavailable(_) => "runtime_unavailable",
            ControlPlaneError::NotFound(_) => "not_found",
            ControlPlaneError::ClusterNotFound(_) => "cluster_not_found",
            ControlPlaneError::TopicNotFound(_) => "topic_not_found",
            ControlPlaneError::DuplicateCluster(_) => "duplicate_cluster",
            ControlPlaneError::InvalidClusterName { .. } => "invalid_cluster_name",
            ControlPlaneError::InvalidTopicSpec(_) => "invalid_topic_spec",
            ControlPlaneError::CannotDeleteDefault => "cannot_delete_default",
            ControlPlaneError::PortSpaceExhausted { .. } => "port_space_exhausted",
            ControlPlaneError::MalformedDescription(_) => "malformed_description",
            ControlPlaneError::AdminUnreachable(_) => "admin_unreachable",
            ControlPlaneError::TopicAlreadyExists(_) => "topic_already_exists",
            ControlPlaneError::StepFailed { .. } => "step_failed",
            ControlPlaneError::CascadeIncomplete { .. } => "cascade_incomplete",
            ControlPlaneError::Io(_) => "io",
        }
    }
}

impl From<RuntimeError> for ControlPlaneError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Unavailable(reason) => ControlPlaneError::RuntimeUnavailable(reason),
            RuntimeError::NotFound(name) => ControlPlaneError::NotFound(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_names_step_and_cause() {
        let err = ControlPlaneError::RuntimeUnavailable("socket closed".into())
            .at_step(LifecycleStep::RemoveContainer, "kafka4");
        assert_eq!(
            err.to_string(),
            "remove container of broker 'kafka4' failed: container runtime unavailable: socket closed"
        );
        assert!(matches!(
            err.root(),
            ControlPlaneError::RuntimeUnavailable(_)
        ));
        assert_eq!(err.code(), "step_failed");
    }

    #[test]
    fn cascade_failure_lists_brokers() {
        let err = ControlPlaneError::CascadeIncomplete {
            cluster: "beta".into(),
            failed: vec![BrokerFailure {
                broker: "kafka-beta-1".into(),
                error: "runtime down".into(),
            }],
        };
        assert_eq!(
            err.to_string(),
            "cluster 'beta' was not deleted; brokers left behind: kafka-beta-1 (runtime down)"
        );
    }

    #[test]
    fn runtime_errors_map_onto_taxonomy() {
        let err: ControlPlaneError = RuntimeError::NotFound("kafka9".into()).into();
        assert!(matches!(err, ControlPlaneError::NotFound(name) if name == "kafka9"));
    }
}
