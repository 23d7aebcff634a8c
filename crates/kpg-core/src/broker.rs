//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Broker state machine and the add, start, stop and delete sequences."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use kpg_common::config::ClusterConfig;
use kpg_common::DEFAULT_CLUSTER_ID;

use crate::description::{
    broker_name, BrokerBlueprint, DescriptionStore, OrchestrationDescription, ServiceEntry,
};
use crate::error::{ControlPlaneError, LifecycleStep, Result};
use crate::ports::PortAllocator;
use crate::runtime::{tolerate_missing, ContainerRuntime, ContainerStatus};
use crate::scope::MutationScope;

/// Lifecycle position of a broker, derived from desired and observed facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Requested,
    Provisioning,
    Running,
    Stopped,
    Removing,
    Gone,
}

impl BrokerState {
    /// Combine "declared in the description" with the runtime's view.
    pub fn observe(declared: bool, status: Option<ContainerStatus>) -> Self {
        match (declared, status) {
            (_, Some(ContainerStatus::Removing)) => BrokerState::Removing,
            (false, None) => BrokerState::Gone,
            // A container whose declaration is already gone is on its way out.
            (false, Some(_)) => BrokerState::Removing,
            (true, None) => BrokerState::Requested,
            (true, Some(ContainerStatus::Running)) => BrokerState::Running,
            (true, Some(ContainerStatus::Exited | ContainerStatus::Paused | ContainerStatus::Dead)) => {
                BrokerState::Stopped
            }
            (true, Some(ContainerStatus::Created | ContainerStatus::Restarting | ContainerStatus::Unknown)) => {
                BrokerState::Provisioning
            }
        }
    }

    pub fn can_transition_to(self, next: BrokerState) -> bool {
        use BrokerState::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Requested, Running)
                | (Provisioning, Running)
                | (Provisioning, Stopped)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Stopped, Provisioning)
                | (Requested | Provisioning | Running | Stopped, Removing)
                | (Removing, Gone)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Requested => "requested",
            BrokerState::Provisioning => "provisioning",
            BrokerState::Running => "running",
            BrokerState::Stopped => "stopped",
            BrokerState::Removing => "removing",
            BrokerState::Gone => "gone",
        }
    }
}

/// Result of a successful add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedBroker {
    pub name: String,
    pub cluster_id: String,
    pub ordinal: u32,
    pub port: u16,
}

/// Result of a successful delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedBroker {
    pub name: String,
    pub cluster_id: String,
    pub port: Option<u16>,
    pub volumes: Vec<String>,
}

/// Point-in-time view of one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub name: String,
    pub cluster_id: Option<String>,
    pub port: Option<u16>,
    pub state: BrokerState,
    pub container: Option<ContainerStatus>,
}

/// Runs broker add, start, stop and delete against the description and runtime.
pub struct BrokerLifecycleManager {
    store: DescriptionStore,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    settings: ClusterConfig,
    project: String,
}

impl BrokerLifecycleManager {
    pub fn new(
        store: DescriptionStore,
        runtime: Arc<dyn ContainerRuntime>,
        ports: PortAllocator,
        settings: ClusterConfig,
        project: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runtime,
            ports,
            settings,
            project: project.into(),
        }
    }

    /// Declare a new broker in `cluster_id` and request its start.
    ///
    /// The caller has already confirmed that the cluster exists. Returns once
    /// the description is durable and the runtime accepted the start request.
    pub async fn add(
        &self,
        scope: &mut MutationScope<'_>,
        cluster_id: &str,
    ) -> Result<ProvisionedBroker> {
        let mut description = scope.read()?;
        let (name, ordinal) = next_identity(&description, cluster_id);
        let port = self.ports.next_port(&description.declared_ports())?;
        let template = template_for(&description, cluster_id);

        let blueprint = BrokerBlueprint {
            name: &name,
            cluster_id,
            ordinal,
            host_port: port,
        };
        description.insert_broker(&blueprint, template.as_ref(), &self.settings, &self.project);
        scope
            .write(&description)
            .map_err(|err| err.at_step(LifecycleStep::PersistDescription, &name))?;
        info!(
            cluster = cluster_id,
            broker = %name,
            port,
            templated = template.is_some(),
            "broker declared"
        );

        self.runtime
            .up(std::slice::from_ref(&name))
            .await
            .map_err(|err| ControlPlaneError::from(err).at_step(LifecycleStep::RequestStart, &name))?;
        debug!(broker = %name, "start requested");

        Ok(ProvisionedBroker {
            name,
            cluster_id: cluster_id.to_owned(),
            ordinal,
            port,
        })
    }

    /// Start a declared broker. Compose reads the description during `up`, so
    /// the caller holds the mutation scope for the whole call.
    pub async fn start(&self, scope: &mut MutationScope<'_>, name: &str) -> Result<BrokerState> {
        let description = scope.read()?;
        let (service, _) = description
            .broker_entry(name)
            .ok_or_else(|| ControlPlaneError::NotFound(name.to_owned()))?;
        let current = self.observe(name, true).await?;
        match current {
            BrokerState::Running => {
                debug!(broker = name, "already running");
                return Ok(current);
            }
            BrokerState::Requested => self.runtime.up(std::slice::from_ref(service)).await?,
            state if state.can_transition_to(BrokerState::Running) => self.runtime.start(name).await?,
            _ => return Err(ControlPlaneError::NotFound(name.to_owned())),
        }
        info!(broker = name, from = current.as_str(), "broker start requested");
        self.observe(name, true).await
    }

    pub async fn stop(&self, name: &str) -> Result<BrokerState> {
        let description = self.store.read()?;
        if description.broker_entry(name).is_none() {
            return Err(ControlPlaneError::NotFound(name.to_owned()));
        }
        let current = self.observe(name, true).await?;
        if current == BrokerState::Stopped {
            debug!(broker = name, "already stopped");
            return Ok(current);
        }
        if !current.can_transition_to(BrokerState::Stopped) {
            return Err(ControlPlaneError::NotFound(name.to_owned()));
        }
        self.runtime.stop(name).await?;
        info!(broker = name, from = current.as_str(), "broker stop requested");
        self.observe(name, true).await
    }

    /// Stop, remove the container, drop the declaration, then remove the data volume.
    pub async fn delete(&self, scope: &mut MutationScope<'_>, name: &str) -> Result<RemovedBroker> {
        let mut description = scope.read()?;
        let (cluster_id, port) = {
            let (_, entry) = description
                .broker_entry(name)
                .ok_or_else(|| ControlPlaneError::NotFound(name.to_owned()))?;
            (
                entry.cluster_id().unwrap_or(DEFAULT_CLUSTER_ID).to_owned(),
                entry.host_port(),
            )
        };

        let containers = self
            .runtime
            .list_containers()
            .await
            .map_err(|err| ControlPlaneError::from(err).at_step(LifecycleStep::Inspect, name))?;
        let status = containers.get(name).map(|container| container.status);
        if matches!(
            status,
            Some(ContainerStatus::Running | ContainerStatus::Restarting)
        ) {
            tolerate_missing(self.runtime.stop(name).await)
                .map_err(|err| ControlPlaneError::from(err).at_step(LifecycleStep::Stop, name))?;
        }
        let removed = tolerate_missing(self.runtime.remove(name).await).map_err(|err| {
            ControlPlaneError::from(err).at_step(LifecycleStep::RemoveContainer, name)
        })?;
        if !removed {
            debug!(broker = name, "container already absent");
        }

        let volumes = description
            .remove_broker(name, &self.project)
            .unwrap_or_default();
        scope
            .write(&description)
            .map_err(|err| err.at_step(LifecycleStep::RemoveDeclaration, name))?;
        info!(cluster = %cluster_id, broker = name, ?port, "broker unregistered");

        for volume in &volumes {
            let removed = tolerate_missing(self.runtime.remove_volume(volume).await).map_err(|err| {
                ControlPlaneError::from(err).at_step(LifecycleStep::RemoveVolume, name)
            })?;
            if !removed {
                warn!(broker = name, volume = %volume, "data volume already absent");
            }
        }

        Ok(RemovedBroker {
            name: name.to_owned(),
            cluster_id,
            port,
            volumes,
        })
    }

    /// Current state of a broker; unknown names report [`BrokerState::Gone`].
    pub async fn status(&self, name: &str) -> Result<BrokerStatus> {
        let description = self.store.read()?;
        let entry = description.broker_entry(name).map(|(_, entry)| entry);
        let containers = self.runtime.list_containers().await?;
        let container = containers.get(name).map(|container| container.status);
        Ok(BrokerStatus {
            name: name.to_owned(),
            cluster_id: entry.and_then(|entry| entry.cluster_id().map(str::to_owned)),
            port: entry.and_then(ServiceEntry::host_port),
            state: BrokerState::observe(entry.is_some(), container),
            container,
        })
    }

    async fn observe(&self, name: &str, declared: bool) -> Result<BrokerState> {
        let containers = self.runtime.list_containers().await?;
        Ok(BrokerState::observe(
            declared,
            containers.get(name).map(|container| container.status),
        ))
    }
}

/// Next free name and ordinal for a broker in `cluster_id`.
fn next_identity(description: &OrchestrationDescription, cluster_id: &str) -> (String, u32) {
    let mut ordinal = description
        .brokers_of(cluster_id)
        .iter()
        .filter_map(|broker| broker.ordinal)
        .max()
        .unwrap_or(0)
        + 1;
    loop {
        let name = broker_name(cluster_id, ordinal);
        let taken = description.services.iter().any(|(service, entry)| {
            service == &name || entry.container_name.as_deref() == Some(name.as_str())
        });
        if !taken {
            return (name, ordinal);
        }
        ordinal += 1;
    }
}

/// First broker of the cluster, else the first default broker.
fn template_for(description: &OrchestrationDescription, cluster_id: &str) -> Option<ServiceEntry> {
    [cluster_id, DEFAULT_CLUSTER_ID]
        .into_iter()
        .find_map(|cluster| {
            let first = description.brokers_of(cluster).into_iter().next()?;
            description
                .broker_entry(&first.name)
                .map(|(_, entry)| entry.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_table() {
        use ContainerStatus as C;
        assert_eq!(BrokerState::observe(true, None), BrokerState::Requested);
        assert_eq!(BrokerState::observe(true, Some(C::Created)), BrokerState::Provisioning);
        assert_eq!(BrokerState::observe(true, Some(C::Restarting)), BrokerState::Provisioning);
        assert_eq!(BrokerState::observe(true, Some(C::Running)), BrokerState::Running);
        assert_eq!(BrokerState::observe(true, Some(C::Exited)), BrokerState::Stopped);
        assert_eq!(BrokerState::observe(true, Some(C::Paused)), BrokerState::Stopped);
        assert_eq!(BrokerState::observe(false, Some(C::Removing)), BrokerState::Removing);
        assert_eq!(BrokerState::observe(false, None), BrokerState::Gone);
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use BrokerState::*;
        assert!(Requested.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Removing));
        assert!(Removing.can_transition_to(Gone));
        assert!(!Gone.can_transition_to(Running));
        assert!(!Removing.can_transition_to(Running));
        assert!(!Running.can_transition_to(Requested));
    }

    #[test]
    fn identity_skips_taken_names() {
        let settings = ClusterConfig::default();
        let mut description = OrchestrationDescription::baseline(&settings, "kafka-playground");
        assert_eq!(
            next_identity(&description, DEFAULT_CLUSTER_ID),
            ("kafka4".to_owned(), 4)
        );
        assert_eq!(next_identity(&description, "beta"), ("kafka-beta-1".to_owned(), 1));

        description
            .services
            .insert("kafka4".to_owned(), ServiceEntry::default());
        assert_eq!(
            next_identity(&description, DEFAULT_CLUSTER_ID),
            ("kafka5".to_owned(), 5)
        );
    }

    #[test]
    fn template_falls_back_to_default_cluster() {
        let settings = ClusterConfig::default();
        let description = OrchestrationDescription::baseline(&settings, "kafka-playground");
        let template = template_for(&description, "beta").unwrap();
        assert_eq!(template.container_name.as_deref(), Some("kafka1"));
    }
}
