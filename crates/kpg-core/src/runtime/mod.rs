//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Container runtime abstraction with docker and simulated backends."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::description::{ServiceRole, CLUSTER_LABEL, ROLE_LABEL};

pub mod docker;
pub mod simulated;

pub use docker::DockerRuntime;
pub use simulated::SimulatedRuntime;

/// Label compose stamps on every container it creates.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Failures reported by a runtime backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Unavailable(String),
    #[error("'{0}' is unknown to the container runtime")]
    NotFound(String),
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Removing,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

/// One container visible to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    pub fn role(&self) -> ServiceRole {
        ServiceRole::from_label(self.labels.get(ROLE_LABEL).map(String::as_str))
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.labels.get(CLUSTER_LABEL).map(String::as_str)
    }
}

/// Containers keyed by name.
pub type ContainerMap = BTreeMap<String, ContainerInfo>;

/// Operations the control plane needs from the container runtime.
///
/// Every call is asynchronous relative to its visible effect: a successful
/// `start` or `up` only means the runtime accepted the request. Callers poll
/// `list_containers` to observe progress.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn list_containers(&self) -> Result<ContainerMap, RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
    /// Create and start the named services, or every declared service when
    /// `services` is empty (removing orphans).
    async fn up(&self, services: &[String]) -> Result<(), RuntimeError>;
    async fn list_volumes(&self) -> Result<Vec<String>, RuntimeError>;
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
}

/// Treat a `NotFound` as success; the target is already gone.
pub fn tolerate_missing(result: Result<(), RuntimeError>) -> Result<bool, RuntimeError> {
    match result {
        Ok(()) => Ok(true),
        Err(RuntimeError::NotFound(_)) => Ok(false),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(ContainerStatus::parse("Running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("zombie"), ContainerStatus::Unknown);
    }

    #[test]
    fn missing_targets_are_tolerated() {
        assert_eq!(tolerate_missing(Ok(())), Ok(true));
        assert_eq!(
            tolerate_missing(Err(RuntimeError::NotFound("kafka2".into()))),
            Ok(false)
        );
        assert!(tolerate_missing(Err(RuntimeError::Unavailable("down".into()))).is_err());
    }
}
