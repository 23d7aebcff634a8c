//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Durable cluster records and the cluster view derived from the description."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kpg_common::config::{ClusterConfig, EndpointStyle};
use kpg_common::DEFAULT_CLUSTER_ID;

use crate::description::{DeclaredBroker, OrchestrationDescription};
use crate::error::{ControlPlaneError, Result};

const REGISTRY_SCHEMA_VERSION: u32 = 1;
const MAX_CLUSTER_NAME_LEN: usize = 32;

/// Persisted metadata for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: String,
    pub name: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl ClusterRecord {
    fn default_record() -> Self {
        Self {
            id: DEFAULT_CLUSTER_ID.to_owned(),
            name: DEFAULT_CLUSTER_ID.to_owned(),
            sequence: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryEnvelope {
    schema_version: u32,
    next_sequence: u64,
    clusters: Vec<ClusterRecord>,
}

#[derive(Debug, Clone)]
struct RegistryState {
    next_sequence: u64,
    records: Vec<ClusterRecord>,
}

/// Cluster records backed by a JSON document on disk.
///
/// Broker membership is not stored here; it is read from the description
/// whenever a [`Cluster`] view is built.
#[derive(Debug)]
pub struct ClusterRegistry {
    path: PathBuf,
    state: RwLock<RegistryState>,
}

impl ClusterRegistry {
    /// Load the registry at `path`, creating it with only `default` when absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = if path.exists() {
            let raw = fs::read(&path)?;
            let envelope: RegistryEnvelope = serde_json::from_slice(&raw).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("cluster registry {} is unreadable: {err}", path.display()),
                )
            })?;
            if envelope.schema_version != REGISTRY_SCHEMA_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "cluster registry {} has schema version {}, expected {}",
                        path.display(),
                        envelope.schema_version,
                        REGISTRY_SCHEMA_VERSION
                    ),
                )
                .into());
            }
            RegistryState {
                next_sequence: envelope.next_sequence,
                records: envelope.clusters,
            }
        } else {
            RegistryState {
                next_sequence: 1,
                records: Vec::new(),
            }
        };

        if !state.records.iter().any(|record| record.id == DEFAULT_CLUSTER_ID) {
            state.records.push(ClusterRecord::default_record());
        }
        state.records.sort_by_key(|record| record.sequence);
        let registry = Self {
            path,
            state: RwLock::new(state),
        };
        registry.persist(&registry.state.read())?;
        debug!(path = %registry.path.display(), "cluster registry loaded");
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check a requested name and return the id it maps to.
    pub fn validate_name(name: &str) -> Result<String> {
        let invalid = |reason| ControlPlaneError::InvalidClusterName {
            name: name.to_owned(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(invalid("must be at most 32 characters"));
        }
        if !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        {
            return Err(invalid("may only contain ASCII letters, digits and hyphens"));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("must not start or end with a hyphen"));
        }
        Ok(name.to_ascii_lowercase())
    }

    pub fn create(&self, name: &str) -> Result<ClusterRecord> {
        let id = Self::validate_name(name)?;
        let mut state = self.state.write();
        if state.records.iter().any(|record| record.id == id) {
            return Err(ControlPlaneError::DuplicateCluster(id));
        }
        let record = ClusterRecord {
            id,
            name: name.to_owned(),
            sequence: state.next_sequence,
            created_at: Utc::now(),
        };
        let mut next = state.clone();
        next.next_sequence += 1;
        next.records.push(record.clone());
        self.persist(&next)?;
        *state = next;
        info!(cluster = %record.id, "cluster created");
        Ok(record)
    }

    /// Records in creation order; `default` is always first.
    pub fn records(&self) -> Vec<ClusterRecord> {
        self.state.read().records.clone()
    }

    pub fn get(&self, id: &str) -> Option<ClusterRecord> {
        let id = id.to_ascii_lowercase();
        self.state
            .read()
            .records
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Drop a record. Callers cascade broker removal first.
    pub fn remove(&self, id: &str) -> Result<Option<ClusterRecord>> {
        let id = id.to_ascii_lowercase();
        if id == DEFAULT_CLUSTER_ID {
            return Err(ControlPlaneError::CannotDeleteDefault);
        }
        let mut state = self.state.write();
        let Some(index) = state.records.iter().position(|record| record.id == id) else {
            return Ok(None);
        };
        let mut next = state.clone();
        let removed = next.records.remove(index);
        self.persist(&next)?;
        *state = next;
        info!(cluster = %removed.id, "cluster record removed");
        Ok(Some(removed))
    }

    /// Remove every record except `default`, returning the removed ids.
    pub fn retain_default(&self) -> Result<Vec<String>> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let removed: Vec<String> = next
            .records
            .iter()
            .filter(|record| record.id != DEFAULT_CLUSTER_ID)
            .map(|record| record.id.clone())
            .collect();
        next.records.retain(|record| record.id == DEFAULT_CLUSTER_ID);
        self.persist(&next)?;
        *state = next;
        Ok(removed)
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let envelope = RegistryEnvelope {
            schema_version: REGISTRY_SCHEMA_VERSION,
            next_sequence: state.next_sequence,
            clusters: state.records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let staging = self.path.with_extension("json.tmp");
        let mut file = File::create(&staging)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// Renders broker bootstrap endpoints.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    style: EndpointStyle,
    advertised_host: String,
    internal_port: u16,
}

impl EndpointPolicy {
    pub fn from_config(settings: &ClusterConfig) -> Self {
        Self {
            style: settings.endpoint_style,
            advertised_host: settings.advertised_host.clone(),
            internal_port: settings.internal_port,
        }
    }

    pub fn endpoint(&self, broker: &DeclaredBroker) -> Option<String> {
        match self.style {
            EndpointStyle::Host => broker
                .port
                .map(|port| format!("{}:{port}", self.advertised_host)),
            EndpointStyle::Internal => Some(format!("{}:{}", broker.name, self.internal_port)),
        }
    }

    pub fn endpoints<'a>(&self, brokers: impl IntoIterator<Item = &'a DeclaredBroker>) -> Vec<String> {
        brokers
            .into_iter()
            .filter_map(|broker| self.endpoint(broker))
            .collect()
    }
}

/// Broker membership entry of a [`Cluster`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterBroker {
    pub name: String,
    pub ordinal: Option<u32>,
    pub port: Option<u16>,
}

/// A cluster as seen by callers: its record joined with the declared brokers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub brokers: Vec<ClusterBroker>,
    pub bootstrap_servers: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Present only as broker labels, without a registry record.
    pub discovered: bool,
}

impl Cluster {
    pub fn broker_names(&self) -> Vec<String> {
        self.brokers.iter().map(|broker| broker.name.clone()).collect()
    }

    fn build(
        id: &str,
        name: &str,
        created_at: Option<DateTime<Utc>>,
        description: &OrchestrationDescription,
        endpoints: &EndpointPolicy,
    ) -> Self {
        let declared = description.brokers_of(id);
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            bootstrap_servers: endpoints.endpoints(&declared),
            brokers: declared
                .into_iter()
                .map(|broker| ClusterBroker {
                    name: broker.name,
                    ordinal: broker.ordinal,
                    port: broker.port,
                })
                .collect(),
            created_at,
            discovered: false,
        }
    }
}

/// Join records with the description. Clusters that only exist as broker
/// labels follow the recorded ones, sorted by id.
pub fn materialize(
    records: &[ClusterRecord],
    description: &OrchestrationDescription,
    endpoints: &EndpointPolicy,
) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = records
        .iter()
        .map(|record| {
            Cluster::build(
                &record.id,
                &record.name,
                Some(record.created_at),
                description,
                endpoints,
            )
        })
        .collect();
    for id in description.cluster_ids() {
        if records.iter().any(|record| record.id == id) {
            continue;
        }
        warn!(
            cluster = %id,
            "brokers reference a cluster without a registry record; surfacing it as discovered"
        );
        let mut cluster = Cluster::build(&id, &id, None, description, endpoints);
        cluster.discovered = true;
        clusters.push(cluster);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{BrokerBlueprint, OrchestrationDescription};

    fn open(dir: &tempfile::TempDir) -> ClusterRegistry {
        ClusterRegistry::open(dir.path().join("state/clusters.json")).unwrap()
    }

    #[test]
    fn fresh_registry_holds_only_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        let ids: Vec<_> = registry.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["default"]);
        assert!(registry.path().exists());
    }

    #[test]
    fn names_are_validated() {
        let long = "x".repeat(33);
        for bad in ["", "-beta", "beta-", "be ta", "béta", long.as_str()] {
            let err = ClusterRegistry::validate_name(bad).unwrap_err();
            assert!(
                matches!(err, ControlPlaneError::InvalidClusterName { .. }),
                "{bad:?} accepted"
            );
        }
        assert_eq!(ClusterRegistry::validate_name("Team-A1").unwrap(), "team-a1");
    }

    #[test]
    fn duplicates_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        let record = registry.create("Beta").unwrap();
        assert_eq!(record.id, "beta");
        assert_eq!(record.name, "Beta");
        assert!(matches!(
            registry.create("BETA"),
            Err(ControlPlaneError::DuplicateCluster(id)) if id == "beta"
        ));
        assert!(matches!(
            registry.create("Default"),
            Err(ControlPlaneError::DuplicateCluster(_))
        ));
    }

    #[test]
    fn records_survive_reopen_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = open(&dir);
            registry.create("zeta").unwrap();
            registry.create("alpha").unwrap();
        }
        let registry = open(&dir);
        let ids: Vec<_> = registry.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["default", "zeta", "alpha"]);
        assert_eq!(registry.get("ALPHA").unwrap().name, "alpha");
    }

    #[test]
    fn default_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        assert!(matches!(
            registry.remove("default"),
            Err(ControlPlaneError::CannotDeleteDefault)
        ));
        registry.create("beta").unwrap();
        registry.create("gamma").unwrap();
        assert_eq!(registry.retain_default().unwrap(), vec!["beta", "gamma"]);
        assert_eq!(registry.records().len(), 1);
    }

    #[test]
    fn views_join_records_with_declared_brokers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.create("beta").unwrap();
        let settings = ClusterConfig::default();
        let mut description = OrchestrationDescription::baseline(&settings, "kafka-playground");
        description.insert_broker(
            &BrokerBlueprint {
                name: "kafka-orphan-1",
                cluster_id: "orphan",
                ordinal: 1,
                host_port: 9200,
            },
            None,
            &settings,
            "kafka-playground",
        );

        let clusters = materialize(
            &registry.records(),
            &description,
            &EndpointPolicy::from_config(&settings),
        );
        let ids: Vec<_> = clusters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["default", "beta", "orphan"]);
        assert_eq!(
            clusters[0].bootstrap_servers,
            vec!["localhost:9092", "localhost:9093", "localhost:9094"]
        );
        assert!(clusters[1].brokers.is_empty());
        assert!(clusters[2].discovered);
    }

    #[test]
    fn internal_endpoints_use_container_names() {
        let settings = ClusterConfig {
            endpoint_style: EndpointStyle::Internal,
            ..ClusterConfig::default()
        };
        let policy = EndpointPolicy::from_config(&settings);
        let broker = DeclaredBroker {
            service: "kafka2".into(),
            name: "kafka2".into(),
            cluster_id: "default".into(),
            ordinal: Some(2),
            port: Some(9093),
        };
        assert_eq!(policy.endpoint(&broker).as_deref(), Some("kafka2:29092"));
    }
}
