//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "In-memory container runtime driven by the description file."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::description::DescriptionStore;

use super::{
    ContainerInfo, ContainerMap, ContainerRuntime, ContainerStatus, RuntimeError,
    COMPOSE_PROJECT_LABEL,
};

#[derive(Debug, Clone)]
struct SimContainer {
    status: ContainerStatus,
    labels: BTreeMap<String, String>,
    /// Polls left in `created` before the container reports `running`.
    warming: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    containers: BTreeMap<String, SimContainer>,
    volumes: BTreeSet<String>,
    unavailable: Option<String>,
    failing: BTreeMap<String, String>,
}

/// Runtime that keeps containers and volumes in memory.
///
/// `up` reads the same description file the control plane writes, so the
/// simulated environment follows every add, delete and reset.
pub struct SimulatedRuntime {
    store: DescriptionStore,
    project: String,
    startup_polls: u32,
    state: Mutex<SimState>,
}

impl SimulatedRuntime {
    pub fn new(store: DescriptionStore, project: impl Into<String>, startup_polls: u32) -> Self {
        Self {
            store,
            project: project.into(),
            startup_polls,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make every call fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().unavailable = reason.map(str::to_owned);
    }

    /// Make operations on one container fail with `Unavailable`.
    pub fn fail_container(&self, name: &str, reason: &str) {
        self.state
            .lock()
            .failing
            .insert(name.to_owned(), reason.to_owned());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Create a volume outside the description, as a user would by hand.
    pub fn seed_volume(&self, name: &str) {
        self.state.lock().volumes.insert(name.to_owned());
    }

    /// Create a container outside the description.
    pub fn seed_container(&self, name: &str, status: ContainerStatus, labels: BTreeMap<String, String>) {
        self.state.lock().containers.insert(
            name.to_owned(),
            SimContainer {
                status,
                labels,
                warming: None,
            },
        );
    }

    pub fn status_of(&self, name: &str) -> Option<ContainerStatus> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|container| container.status)
    }

    pub fn volume_names(&self) -> BTreeSet<String> {
        self.state.lock().volumes.clone()
    }

    fn check(&self, state: &SimState, target: Option<&str>) -> Result<(), RuntimeError> {
        if let Some(reason) = &state.unavailable {
            return Err(RuntimeError::Unavailable(reason.clone()));
        }
        if let Some(reason) = target.and_then(|name| state.failing.get(name)) {
            return Err(RuntimeError::Unavailable(reason.clone()));
        }
        Ok(())
    }

    fn boot(&self, container: &mut SimContainer) {
        if self.startup_polls == 0 {
            container.status = ContainerStatus::Running;
            container.warming = None;
        } else {
            container.status = ContainerStatus::Created;
            container.warming = Some(self.startup_polls);
        }
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn list_containers(&self) -> Result<ContainerMap, RuntimeError> {
        let mut state = self.state.lock();
        self.check(&state, None)?;
        let mut listing = ContainerMap::new();
        for (name, container) in state.containers.iter_mut() {
            match container.warming {
                Some(0) => {
                    container.status = ContainerStatus::Running;
                    container.warming = None;
                }
                Some(left) => container.warming = Some(left - 1),
                None => {}
            }
            listing.insert(
                name.clone(),
                ContainerInfo {
                    name: name.clone(),
                    status: container.status,
                    labels: container.labels.clone(),
                },
            );
        }
        Ok(listing)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        self.check(&state, Some(name))?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))?;
        if !container.status.is_running() {
            self.boot(container);
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        self.check(&state, Some(name))?;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))?;
        container.status = ContainerStatus::Exited;
        container.warming = None;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        self.check(&state, Some(name))?;
        state
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))
    }

    async fn up(&self, services: &[String]) -> Result<(), RuntimeError> {
        let description = self
            .store
            .read()
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        let mut state = self.state.lock();
        self.check(&state, None)?;

        let targets: Vec<String> = if services.is_empty() {
            description.services.keys().cloned().collect()
        } else {
            for service in services {
                if !description.services.contains_key(service) {
                    return Err(RuntimeError::NotFound(service.clone()));
                }
            }
            services.to_vec()
        };

        if services.is_empty() {
            let declared: BTreeSet<String> = description
                .services
                .iter()
                .map(|(service, entry)| entry.container_name_or(service).to_owned())
                .collect();
            let project = self.project.clone();
            state.containers.retain(|name, container| {
                let ours = container.labels.get(COMPOSE_PROJECT_LABEL) == Some(&project);
                !ours || declared.contains(name)
            });
        }

        for service in targets {
            let Some(entry) = description.services.get(&service) else {
                continue;
            };
            for volume in entry.named_volumes() {
                let physical = description.volume_physical_name(&volume, &self.project);
                state.volumes.insert(physical);
            }
            let name = entry.container_name_or(&service).to_owned();
            let mut labels: BTreeMap<String, String> = entry
                .labels
                .iter()
                .map(|(key, value)| (key.clone(), value.clone().unwrap_or_default()))
                .collect();
            labels.insert(COMPOSE_PROJECT_LABEL.to_owned(), self.project.clone());

            let container = state
                .containers
                .entry(name.clone())
                .or_insert_with(|| SimContainer {
                    status: ContainerStatus::Created,
                    labels: labels.clone(),
                    warming: None,
                });
            container.labels = labels;
            if !container.status.is_running() && container.warming.is_none() {
                self.boot(container);
            }
            debug!(container = %name, status = container.status.as_str(), "simulated up");
        }
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>, RuntimeError> {
        let state = self.state.lock();
        self.check(&state, None)?;
        Ok(state.volumes.iter().cloned().collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        self.check(&state, Some(name))?;
        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::OrchestrationDescription;
    use kpg_common::config::ClusterConfig;

    fn runtime(polls: u32) -> (tempfile::TempDir, SimulatedRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptionStore::new(dir.path().join("docker-compose.yml"));
        store
            .write(&OrchestrationDescription::baseline(
                &ClusterConfig::default(),
                "kafka-playground",
            ))
            .unwrap();
        (dir, SimulatedRuntime::new(store, "kafka-playground", polls))
    }

    #[tokio::test]
    async fn up_creates_declared_services_and_volumes() {
        let (_dir, runtime) = runtime(0);
        runtime.up(&[]).await.unwrap();
        let containers = runtime.list_containers().await.unwrap();
        assert!(containers["kafka1"].status.is_running());
        assert_eq!(containers["kafka2"].labels["kpg.role"], "broker");
        assert!(containers.contains_key("zookeeper"));
        assert!(runtime
            .volume_names()
            .contains("kafka-playground-kafka3-data"));
    }

    #[tokio::test]
    async fn containers_warm_up_over_polls() {
        let (_dir, runtime) = runtime(2);
        runtime.up(&["kafka1".to_owned()]).await.unwrap();
        let first = runtime.list_containers().await.unwrap();
        assert_eq!(first["kafka1"].status, ContainerStatus::Created);
        let second = runtime.list_containers().await.unwrap();
        assert_eq!(second["kafka1"].status, ContainerStatus::Created);
        let third = runtime.list_containers().await.unwrap();
        assert_eq!(third["kafka1"].status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let (_dir, runtime) = runtime(0);
        assert_eq!(
            runtime.stop("kafka9").await,
            Err(RuntimeError::NotFound("kafka9".into()))
        );
        assert!(matches!(
            runtime.up(&["kafka9".to_owned()]).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_runtime_fails_every_call() {
        let (_dir, runtime) = runtime(0);
        runtime.set_unavailable(Some("daemon stopped"));
        assert!(matches!(
            runtime.list_containers().await,
            Err(RuntimeError::Unavailable(_))
        ));
        runtime.set_unavailable(None);
        assert!(runtime.list_containers().await.is_ok());
    }
}
