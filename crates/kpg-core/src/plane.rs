//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Control plane facade routing commands to registry, brokers, topics and reset."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use kpg_common::config::AppConfig;
use kpg_common::DEFAULT_CLUSTER_ID;
use kpg_metrics::{ControlPlaneMetrics, Outcome, SharedRegistry};

use crate::broker::{BrokerLifecycleManager, BrokerState, BrokerStatus, ProvisionedBroker, RemovedBroker};
use crate::description::{DescriptionStore, OrchestrationDescription, ServiceRole};
use crate::error::{BrokerFailure, ControlPlaneError, Result};
use crate::ports::PortAllocator;
use crate::registry::{materialize, Cluster, ClusterRegistry, EndpointPolicy};
use crate::reset::ResetCoordinator;
use crate::runtime::{tolerate_missing, ContainerRuntime, DockerRuntime, SimulatedRuntime};
use crate::scope::DescriptionLock;
use crate::topics::{KafkaTopicAdmin, SimulatedTopicAdmin, TopicAdmin, TopicGateway, TopicInfo, TopicSpec};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Status line for one container in a cluster status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerView {
    pub status: String,
    pub role: ServiceRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<BrokerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Aggregated view used by the dashboard status panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub cluster_id: String,
    pub broker_count: usize,
    pub topic_count: usize,
    pub containers: IndexMap<String, ContainerView>,
    pub kafka_servers: String,
}

/// Outcome of a cluster delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterDeletion {
    pub cluster_id: String,
    pub removed_brokers: Vec<String>,
}

/// Port conflicts found in the description (and optionally on the host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub port_map: BTreeMap<u16, Vec<String>>,
}

/// Assembles a [`ControlPlane`] from configuration, with optional overrides.
pub struct ControlPlaneBuilder<'a> {
    config: &'a AppConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    admin: Option<Arc<dyn TopicAdmin>>,
    metrics_registry: Option<SharedRegistry>,
}

impl<'a> ControlPlaneBuilder<'a> {
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn topic_admin(mut self, admin: Arc<dyn TopicAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    pub fn build(self) -> anyhow::Result<ControlPlane> {
        let config = self.config;
        let project = config.runtime.project_name.clone();
        let store = DescriptionStore::new(&config.runtime.compose_file);

        let baseline = match &config.reset.baseline_file {
            Some(path) => DescriptionStore::new(path)
                .read()
                .with_context(|| format!("while loading baseline description {}", path.display()))?,
            None => OrchestrationDescription::baseline(&config.cluster, &project),
        };
        if store
            .initialize_if_missing(&baseline)
            .with_context(|| format!("while seeding {}", store.path().display()))?
        {
            info!(path = %store.path().display(), "seeded orchestration description from baseline");
        }

        let runtime: Arc<dyn ContainerRuntime> = match self.runtime {
            Some(runtime) => runtime,
            None if config.runtime.mode.is_simulated() => Arc::new(SimulatedRuntime::new(
                store.clone(),
                project.clone(),
                config.runtime.startup_polls,
            )),
            None => Arc::new(
                DockerRuntime::connect(&config.runtime).context("while connecting to docker")?,
            ),
        };
        let admin: Arc<dyn TopicAdmin> = match self.admin {
            Some(admin) => admin,
            None if config.runtime.mode.is_simulated() => Arc::new(SimulatedTopicAdmin::new()),
            None => Arc::new(KafkaTopicAdmin::new(config.topics.request_timeout)),
        };
        let metrics = match self.metrics_registry {
            Some(registry) => Some(ControlPlaneMetrics::new(registry)?),
            None => None,
        };

        let registry = ClusterRegistry::open(&config.cluster.state_path).with_context(|| {
            format!(
                "while opening cluster registry {}",
                config.cluster.state_path.display()
            )
        })?;
        let ports = PortAllocator::new(config.cluster.base_port, config.cluster.port_search_limit)
            .with_reserved(baseline.declared_ports())
            .with_reserved(config.cluster.reserved_ports.iter().copied());
        let endpoints = EndpointPolicy::from_config(&config.cluster);

        let plane = ControlPlane {
            brokers: BrokerLifecycleManager::new(
                store.clone(),
                runtime.clone(),
                ports,
                config.cluster.clone(),
                project.clone(),
            ),
            topics: TopicGateway::new(admin, store.clone(), runtime.clone(), endpoints.clone()),
            reset: ResetCoordinator::new(
                runtime.clone(),
                baseline,
                config.reset.preserved_volumes.iter().cloned(),
                project,
            ),
            lock: DescriptionLock::new(store),
            runtime,
            registry,
            endpoints,
            probe_host_ports: config.topics.probe_host_ports,
            metrics,
        };
        plane.refresh_broker_gauge();
        info!(
            mode = ?config.runtime.mode,
            description = %config.runtime.compose_file.display(),
            "control plane ready"
        );
        Ok(plane)
    }
}

/// Entry point for every control operation.
pub struct ControlPlane {
    lock: DescriptionLock,
    runtime: Arc<dyn ContainerRuntime>,
    registry: ClusterRegistry,
    brokers: BrokerLifecycleManager,
    topics: TopicGateway,
    reset: ResetCoordinator,
    endpoints: EndpointPolicy,
    probe_host_ports: bool,
    metrics: Option<ControlPlaneMetrics>,
}

impl ControlPlane {
    pub fn builder(config: &AppConfig) -> ControlPlaneBuilder<'_> {
        ControlPlaneBuilder {
            config,
            runtime: None,
            admin: None,
            metrics_registry: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Self::builder(config).build()
    }

    pub fn store(&self) -> &DescriptionStore {
        self.lock.store()
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Confirm the container runtime answers.
    pub async fn check_runtime(&self) -> Result<()> {
        self.runtime.list_containers().await?;
        Ok(())
    }

    fn record<T>(&self, operation: &str, result: &Result<T>) {
        if let Some(metrics) = &self.metrics {
            metrics.record(operation, Outcome::from(result));
        }
        if let Err(err) = result {
            debug!(operation, error = %err, "control operation failed");
        }
    }

    fn refresh_broker_gauge(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match self.store().read() {
            Ok(description) => metrics.set_declared_brokers(description.brokers().len()),
            Err(err) => warn!(error = %err, "unable to count declared brokers"),
        }
    }

    fn resolve(&self, id: &str, description: &OrchestrationDescription) -> Result<Cluster> {
        let id = id.to_ascii_lowercase();
        materialize(&self.registry.records(), description, &self.endpoints)
            .into_iter()
            .find(|cluster| cluster.id == id)
            .ok_or(ControlPlaneError::ClusterNotFound(id))
    }

    pub fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let description = self.store().read()?;
        Ok(materialize(&self.registry.records(), &description, &self.endpoints))
    }

    pub fn get_cluster(&self, id: &str) -> Result<Cluster> {
        let description = self.store().read()?;
        self.resolve(id, &description)
    }

    pub async fn create_cluster(&self, name: &str) -> Result<Cluster> {
        let result = async {
            let _scope = self.lock.acquire().await;
            let record = self.registry.create(name)?;
            let description = self.store().read()?;
            self.resolve(&record.id, &description)
        }
        .await;
        self.record("cluster_create", &result);
        result
    }

    /// Delete every broker of the cluster, then its record.
    pub async fn delete_cluster(&self, id: &str) -> Result<ClusterDeletion> {
        let result = async {
            if id.eq_ignore_ascii_case(DEFAULT_CLUSTER_ID) {
                return Err(ControlPlaneError::CannotDeleteDefault);
            }
            let mut scope = self.lock.acquire().await;
            let description = scope.read()?;
            let cluster = self.resolve(id, &description)?;

            let mut removed = Vec::new();
            let mut failed = Vec::new();
            for broker in &cluster.brokers {
                match self.brokers.delete(&mut scope, &broker.name).await {
                    Ok(done) => removed.push(done.name),
                    Err(err) => {
                        warn!(cluster = %cluster.id, broker = %broker.name, error = %err, "cascade delete failed");
                        failed.push(BrokerFailure {
                            broker: broker.name.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            if !failed.is_empty() {
                return Err(ControlPlaneError::CascadeIncomplete {
                    cluster: cluster.id,
                    failed,
                });
            }
            self.registry.remove(&cluster.id)?;
            info!(cluster = %cluster.id, brokers = removed.len(), "cluster deleted");
            Ok(ClusterDeletion {
                cluster_id: cluster.id,
                removed_brokers: removed,
            })
        }
        .await;
        self.record("cluster_delete", &result);
        self.refresh_broker_gauge();
        result
    }

    pub async fn add_broker(&self, cluster_id: &str) -> Result<ProvisionedBroker> {
        let result = async {
            let mut scope = self.lock.acquire().await;
            let description = scope.read()?;
            let cluster = self.resolve(cluster_id, &description)?;
            self.brokers.add(&mut scope, &cluster.id).await
        }
        .await;
        self.record("broker_add", &result);
        self.refresh_broker_gauge();
        result
    }

    pub async fn start_broker(&self, name: &str) -> Result<BrokerState> {
        let result = async {
            let mut scope = self.lock.acquire().await;
            self.brokers.start(&mut scope, name).await
        }
        .await;
        self.record("broker_start", &result);
        result
    }

    pub async fn stop_broker(&self, name: &str) -> Result<BrokerState> {
        let result = self.brokers.stop(name).await;
        self.record("broker_stop", &result);
        result
    }

    pub async fn delete_broker(&self, name: &str) -> Result<RemovedBroker> {
        let result = async {
            let mut scope = self.lock.acquire().await;
            self.brokers.delete(&mut scope, name).await
        }
        .await;
        self.record("broker_delete", &result);
        self.refresh_broker_gauge();
        result
    }

    pub async fn broker_status(&self, name: &str) -> Result<BrokerStatus> {
        self.brokers.status(name).await
    }

    pub async fn cluster_status(&self, cluster_id: &str) -> Result<ClusterStatus> {
        let description = self.store().read()?;
        let cluster = self.resolve(cluster_id, &description)?;
        let containers = self.runtime.list_containers().await?;

        let mut views = IndexMap::new();
        for (service, entry) in &description.services {
            let name = entry.container_name_or(service);
            let in_cluster = match entry.cluster_id() {
                Some(owner) => owner.eq_ignore_ascii_case(&cluster.id),
                None => true,
            };
            if !in_cluster {
                continue;
            }
            let observed = containers.get(name).map(|container| container.status);
            views.insert(
                name.to_owned(),
                ContainerView {
                    status: observed
                        .map(|status| status.as_str().to_owned())
                        .unwrap_or_else(|| "not_found".to_owned()),
                    role: entry.role(),
                    state: entry
                        .is_broker()
                        .then(|| BrokerState::observe(true, observed)),
                    port: entry.host_port(),
                },
            );
        }

        let topic_count = match self.topics.list(&cluster.id).await {
            Ok(topics) => topics.len(),
            Err(err) => {
                debug!(cluster = %cluster.id, error = %err, "topic count unavailable");
                0
            }
        };

        Ok(ClusterStatus {
            broker_count: cluster.brokers.len(),
            topic_count,
            containers: views,
            kafka_servers: cluster.bootstrap_servers.join(","),
            cluster_id: cluster.id,
        })
    }

    /// Bring up the whole declared set, or only one cluster's brokers.
    ///
    /// Holds the mutation scope so compose never reads a description that is
    /// being rewritten.
    pub async fn start_cluster(&self, cluster_id: Option<&str>) -> Result<Vec<String>> {
        let result = async {
            let mut scope = self.lock.acquire().await;
            let description = scope.read()?;
            let services: Vec<String> = match cluster_id {
                None => {
                    self.runtime.up(&[]).await?;
                    return Ok(description.services.keys().cloned().collect());
                }
                Some(id) => {
                    let cluster = self.resolve(id, &description)?;
                    description
                        .brokers_of(&cluster.id)
                        .into_iter()
                        .map(|broker| broker.service)
                        .collect()
                }
            };
            if !services.is_empty() {
                self.runtime.up(&services).await?;
            }
            Ok(services)
        }
        .await;
        self.record("cluster_start", &result);
        result
    }

    /// Stop running brokers of one cluster, or of every cluster.
    pub async fn stop_cluster(&self, cluster_id: Option<&str>) -> Result<Vec<String>> {
        let result = async {
            let description = self.store().read()?;
            let containers = self.runtime.list_containers().await?;
            let targets: Vec<String> = match cluster_id {
                Some(id) => {
                    let cluster = self.resolve(id, &description)?;
                    cluster.broker_names()
                }
                None => {
                    let mut names: Vec<String> = description
                        .brokers()
                        .into_iter()
                        .map(|broker| broker.name)
                        .collect();
                    names.extend(
                        containers
                            .values()
                            .filter(|container| container.role() == ServiceRole::Broker)
                            .map(|container| container.name.clone()),
                    );
                    names.sort();
                    names.dedup();
                    names
                }
            };

            let mut stopped = Vec::new();
            for name in targets {
                let running = containers
                    .get(&name)
                    .map(|container| container.status.is_running())
                    .unwrap_or(false);
                if running && tolerate_missing(self.runtime.stop(&name).await)? {
                    stopped.push(name);
                }
            }
            info!(cluster = cluster_id.unwrap_or("*"), stopped = stopped.len(), "brokers stopped");
            Ok(stopped)
        }
        .await;
        self.record("cluster_stop", &result);
        result
    }

    pub async fn reset(&self) -> Result<Vec<String>> {
        let started = Instant::now();
        let result = async {
            let mut scope = self.lock.acquire().await;
            self.reset.reset(&mut scope, &self.registry).await
        }
        .await;
        self.record("reset", &result);
        if result.is_ok() {
            if let Some(metrics) = &self.metrics {
                metrics.observe_reset(started.elapsed().as_secs_f64());
            }
        }
        self.refresh_broker_gauge();
        result
    }

    /// Report host ports claimed by more than one service.
    pub async fn validate_config(&self) -> Result<ValidationReport> {
        let description = self.store().read()?;
        let port_map: BTreeMap<u16, Vec<String>> = description.port_map().into_iter().collect();
        let mut issues = Vec::new();
        for (port, services) in &port_map {
            if services.len() > 1 {
                issues.push(format!(
                    "Port {port} is used by multiple services: {}",
                    services.join(", ")
                ));
            }
        }

        if self.probe_host_ports {
            let containers = self.runtime.list_containers().await?;
            for (port, services) in &port_map {
                let ours_running = services.iter().any(|service| {
                    let name = description
                        .services
                        .get(service)
                        .map(|entry| entry.container_name_or(service))
                        .unwrap_or(service.as_str());
                    containers
                        .get(name)
                        .map(|container| container.status.is_running())
                        .unwrap_or(false)
                });
                if !ours_running && port_in_use(*port).await {
                    issues.push(format!("Port {port} is already in use on the host"));
                }
            }
        }

        Ok(ValidationReport {
            valid: issues.is_empty(),
            issues,
            port_map,
        })
    }

    pub async fn list_topics(&self, cluster_id: &str) -> Result<Vec<TopicInfo>> {
        let cluster = self.get_cluster(cluster_id)?;
        let result = self.topics.list(&cluster.id).await;
        self.record("topic_list", &result);
        result
    }

    pub async fn create_topic(&self, cluster_id: &str, spec: &TopicSpec) -> Result<()> {
        let result = async {
            let cluster = self.get_cluster(cluster_id)?;
            self.topics.create(&cluster.id, spec).await
        }
        .await;
        self.record("topic_create", &result);
        result
    }

    pub async fn delete_topic(&self, cluster_id: &str, name: &str) -> Result<()> {
        let result = async {
            let cluster = self.get_cluster(cluster_id)?;
            self.topics.delete(&cluster.id, name).await
        }
        .await;
        self.record("topic_delete", &result);
        result
    }
}

async fn port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
