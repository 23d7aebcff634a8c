//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Topic administration against the running brokers of a cluster."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::description::DescriptionStore;
use crate::error::{ControlPlaneError, Result};
use crate::registry::EndpointPolicy;
use crate::runtime::ContainerRuntime;

pub mod kafka;
pub mod simulated;

pub use kafka::KafkaTopicAdmin;
pub use simulated::SimulatedTopicAdmin;

const MAX_TOPIC_NAME_LEN: usize = 249;

/// A topic as listed by the admin interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: u32,
}

/// Requested shape of a new topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

/// Where admin requests for one cluster are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTarget {
    pub cluster_id: String,
    pub bootstrap: Vec<String>,
    pub running_brokers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicAdminError {
    #[error("{0}")]
    Unreachable(String),
    #[error("topic '{0}' does not exist")]
    UnknownTopic(String),
    #[error("topic '{0}' already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Rejected(String),
}

/// Admin operations against a Kafka cluster.
#[async_trait]
pub trait TopicAdmin: Send + Sync + 'static {
    async fn list_topics(&self, target: &AdminTarget) -> std::result::Result<Vec<TopicInfo>, TopicAdminError>;
    async fn create_topic(
        &self,
        target: &AdminTarget,
        spec: &TopicSpec,
    ) -> std::result::Result<(), TopicAdminError>;
    async fn delete_topic(&self, target: &AdminTarget, name: &str) -> std::result::Result<(), TopicAdminError>;
}

fn map_admin_error(cluster_id: &str, err: TopicAdminError) -> ControlPlaneError {
    match err {
        TopicAdminError::Unreachable(reason) => {
            warn!(cluster = cluster_id, %reason, "kafka admin request failed");
            ControlPlaneError::AdminUnreachable(cluster_id.to_owned())
        }
        TopicAdminError::UnknownTopic(name) => ControlPlaneError::TopicNotFound(name),
        TopicAdminError::AlreadyExists(name) => ControlPlaneError::TopicAlreadyExists(name),
        TopicAdminError::Rejected(reason) => ControlPlaneError::InvalidTopicSpec(reason),
    }
}

fn validate_topic_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ControlPlaneError::InvalidTopicSpec(
            "topic name must not be empty".to_owned(),
        ));
    }
    if name == "." || name == ".." {
        return Err(ControlPlaneError::InvalidTopicSpec(format!(
            "'{name}' is not a legal topic name"
        )));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(ControlPlaneError::InvalidTopicSpec(format!(
            "topic name is longer than {MAX_TOPIC_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
    {
        return Err(ControlPlaneError::InvalidTopicSpec(format!(
            "topic name '{name}' may only contain ASCII letters, digits, '.', '_' and '-'"
        )));
    }
    Ok(())
}

/// Routes topic operations to the currently running brokers of a cluster.
pub struct TopicGateway {
    admin: Arc<dyn TopicAdmin>,
    store: DescriptionStore,
    runtime: Arc<dyn ContainerRuntime>,
    endpoints: EndpointPolicy,
}

impl TopicGateway {
    pub fn new(
        admin: Arc<dyn TopicAdmin>,
        store: DescriptionStore,
        runtime: Arc<dyn ContainerRuntime>,
        endpoints: EndpointPolicy,
    ) -> Self {
        Self {
            admin,
            store,
            runtime,
            endpoints,
        }
    }

    /// Bootstrap endpoints of the running brokers, recomputed on every call.
    pub async fn target(&self, cluster_id: &str) -> Result<AdminTarget> {
        let description = self.store.read()?;
        let containers = self.runtime.list_containers().await?;
        let running: Vec<_> = description
            .brokers_of(cluster_id)
            .into_iter()
            .filter(|broker| {
                containers
                    .get(&broker.name)
                    .map(|container| container.status.is_running())
                    .unwrap_or(false)
            })
            .collect();
        let bootstrap = self.endpoints.endpoints(&running);
        if bootstrap.is_empty() {
            return Err(ControlPlaneError::AdminUnreachable(cluster_id.to_owned()));
        }
        Ok(AdminTarget {
            cluster_id: cluster_id.to_owned(),
            bootstrap,
            running_brokers: running.len(),
        })
    }

    /// User topics sorted by name; internal `_`-prefixed topics are hidden.
    pub async fn list(&self, cluster_id: &str) -> Result<Vec<TopicInfo>> {
        let target = self.target(cluster_id).await?;
        self.list_at(&target).await
    }

    async fn list_at(&self, target: &AdminTarget) -> Result<Vec<TopicInfo>> {
        let mut topics: Vec<TopicInfo> = self
            .admin
            .list_topics(target)
            .await
            .map_err(|err| map_admin_error(&target.cluster_id, err))?
            .into_iter()
            .filter(|topic| !topic.name.starts_with('_'))
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    pub async fn create(&self, cluster_id: &str, spec: &TopicSpec) -> Result<()> {
        validate_topic_name(&spec.name)?;
        if spec.partitions < 1 {
            return Err(ControlPlaneError::InvalidTopicSpec(format!(
                "partitions must be at least 1, got {}",
                spec.partitions
            )));
        }
        let target = self.target(cluster_id).await?;
        if spec.replication_factor < 1 || spec.replication_factor as usize > target.running_brokers {
            return Err(ControlPlaneError::InvalidTopicSpec(format!(
                "replication factor {} must be between 1 and the {} running broker(s)",
                spec.replication_factor, target.running_brokers
            )));
        }
        if self
            .list_at(&target)
            .await?
            .iter()
            .any(|topic| topic.name == spec.name)
        {
            return Err(ControlPlaneError::TopicAlreadyExists(spec.name.clone()));
        }
        self.admin
            .create_topic(&target, spec)
            .await
            .map_err(|err| map_admin_error(cluster_id, err))?;
        info!(
            cluster = cluster_id,
            topic = %spec.name,
            partitions = spec.partitions,
            replication_factor = spec.replication_factor,
            "topic created"
        );
        Ok(())
    }

    pub async fn delete(&self, cluster_id: &str, name: &str) -> Result<()> {
        let target = self.target(cluster_id).await?;
        self.admin
            .delete_topic(&target, name)
            .await
            .map_err(|err| map_admin_error(cluster_id, err))?;
        info!(cluster = cluster_id, topic = name, "topic deleted");
        Ok(())
    }
}
