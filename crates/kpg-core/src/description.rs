//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Compose document model, broker templates and the in-place description store."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
//! The orchestration description is a docker-compose document. Only the keys
//! the control plane edits are modelled; everything else is carried through
//! `extra` maps so a read-modify-write cycle never drops user configuration.
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use tracing::debug;

use kpg_common::config::ClusterConfig;
use kpg_common::DEFAULT_CLUSTER_ID;

use crate::error::{ControlPlaneError, Result};

pub const ROLE_LABEL: &str = "kpg.role";
pub const CLUSTER_LABEL: &str = "kpg.cluster";
pub const ORDINAL_LABEL: &str = "kpg.ordinal";
pub const ZOOKEEPER_SERVICE: &str = "zookeeper";

const BROKER_DATA_DIR: &str = "/var/lib/kafka/data";

/// Classification of a service entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Broker,
    Infra,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Broker => "broker",
            ServiceRole::Infra => "infra",
        }
    }

    /// Role named by a label value. Anything other than `broker` is infrastructure.
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("broker") => ServiceRole::Broker,
            _ => ServiceRole::Infra,
        }
    }
}

/// Whole compose document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationDescription {
    #[serde(default)]
    pub services: IndexMap<String, ServiceEntry>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, Option<VolumeEntry>>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// One service under `services:`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Value>,
    #[serde(
        default,
        skip_serializing_if = "IndexMap::is_empty",
        deserialize_with = "key_value_map"
    )]
    pub environment: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "IndexMap::is_empty",
        deserialize_with = "label_map"
    )]
    pub labels: IndexMap<String, Option<String>>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// One entry under the top-level `volumes:` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// Accepts both the mapping form and the `KEY=value` list form compose allows.
fn key_value_map<'de, D>(deserializer: D) -> std::result::Result<IndexMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let mut map = IndexMap::new();
    match raw {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(entries)) => {
            for (key, value) in entries {
                let key = scalar_to_string(&key).ok_or_else(|| {
                    serde::de::Error::custom("mapping keys must be scalars")
                })?;
                map.insert(key, value);
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items {
                let text = scalar_to_string(&item).ok_or_else(|| {
                    serde::de::Error::custom("list entries must be KEY=value strings")
                })?;
                let (key, value) = match text.split_once('=') {
                    Some((key, value)) => (key.to_owned(), Value::String(value.to_owned())),
                    None => (text.clone(), Value::Null),
                };
                map.insert(key, value);
            }
        }
        Some(_) => {
            return Err(serde::de::Error::custom(
                "expected a mapping or a list of KEY=value strings",
            ))
        }
    }
    Ok(map)
}

/// Label values are strings; a null value stays null.
fn label_map<'de, D>(
    deserializer: D,
) -> std::result::Result<IndexMap<String, Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    key_value_map(deserializer)?
        .into_iter()
        .map(|(key, value)| match value {
            Value::Null => Ok((key, None)),
            other => scalar_to_string(&other)
                .map(|text| (key.clone(), Some(text)))
                .ok_or_else(|| {
                    serde::de::Error::custom(format!("label `{key}` must have a scalar value"))
                }),
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Host side of a compose port declaration. Interpolated and ranged ports yield `None`.
fn host_port_of(value: &Value) -> Option<u16> {
    match value {
        Value::String(spec) => {
            if spec.contains("${") {
                return None;
            }
            let spec = spec.split('/').next().unwrap_or(spec);
            let parts: Vec<&str> = spec.split(':').collect();
            let host = match parts.as_slice() {
                [host, _container] => host,
                [_ip, host, _container] => host,
                _ => return None,
            };
            host.parse().ok()
        }
        Value::Mapping(map) => match map.get("published") {
            Some(Value::Number(number)) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
            Some(Value::String(text)) => text.parse().ok(),
            _ => None,
        },
        _ => None,
    }
}

/// Source of a named volume mount, ignoring bind mounts.
fn named_volume_of(value: &Value) -> Option<String> {
    match value {
        Value::String(spec) => {
            let (source, _) = spec.split_once(':')?;
            if source.is_empty()
                || source.starts_with('/')
                || source.starts_with('.')
                || source.starts_with('~')
                || source.contains("${")
            {
                return None;
            }
            Some(source.to_owned())
        }
        Value::Mapping(map) => {
            let kind = map.get("type").and_then(Value::as_str).unwrap_or("volume");
            if kind != "volume" {
                return None;
            }
            map.get("source").and_then(Value::as_str).map(str::to_owned)
        }
        _ => None,
    }
}

impl ServiceEntry {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key)?.as_deref()
    }

    pub fn role(&self) -> ServiceRole {
        ServiceRole::from_label(self.label(ROLE_LABEL))
    }

    pub fn is_broker(&self) -> bool {
        self.role() == ServiceRole::Broker
    }

    /// Cluster id a broker belongs to. Unlabelled brokers belong to `default`.
    pub fn cluster_id(&self) -> Option<&str> {
        if !self.is_broker() {
            return None;
        }
        Some(self.label(CLUSTER_LABEL).unwrap_or(DEFAULT_CLUSTER_ID))
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.label(ORDINAL_LABEL)?.parse().ok()
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.ports.iter().filter_map(host_port_of).collect()
    }

    /// First host port, the one advertised to clients for brokers.
    pub fn host_port(&self) -> Option<u16> {
        self.ports.iter().find_map(host_port_of)
    }

    pub fn named_volumes(&self) -> Vec<String> {
        self.volumes.iter().filter_map(named_volume_of).collect()
    }

    /// Container name compose will give this service.
    pub fn container_name_or<'a>(&'a self, service: &'a str) -> &'a str {
        self.container_name.as_deref().unwrap_or(service)
    }
}

/// A broker declared in the description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredBroker {
    /// Key under `services:`.
    pub service: String,
    /// Container name.
    pub name: String,
    pub cluster_id: String,
    pub ordinal: Option<u32>,
    pub port: Option<u16>,
}

impl OrchestrationDescription {
    /// Declared brokers in declaration order.
    pub fn brokers(&self) -> Vec<DeclaredBroker> {
        self.services
            .iter()
            .filter_map(|(service, entry)| {
                let cluster_id = entry.cluster_id()?;
                Some(DeclaredBroker {
                    service: service.clone(),
                    name: entry.container_name_or(service).to_owned(),
                    cluster_id: cluster_id.to_owned(),
                    ordinal: entry.ordinal(),
                    port: entry.host_port(),
                })
            })
            .collect()
    }

    /// Brokers of one cluster ordered by ordinal, then name.
    pub fn brokers_of(&self, cluster_id: &str) -> Vec<DeclaredBroker> {
        let mut brokers: Vec<_> = self
            .brokers()
            .into_iter()
            .filter(|broker| broker.cluster_id.eq_ignore_ascii_case(cluster_id))
            .collect();
        brokers.sort_by(|a, b| {
            a.ordinal
                .unwrap_or(u32::MAX)
                .cmp(&b.ordinal.unwrap_or(u32::MAX))
                .then_with(|| a.name.cmp(&b.name))
        });
        brokers
    }

    /// Cluster ids referenced by broker labels.
    pub fn cluster_ids(&self) -> BTreeSet<String> {
        self.brokers()
            .into_iter()
            .map(|broker| broker.cluster_id.to_ascii_lowercase())
            .collect()
    }

    /// Service key and entry of the broker with this container name.
    pub fn broker_entry(&self, name: &str) -> Option<(&String, &ServiceEntry)> {
        self.services
            .iter()
            .find(|(service, entry)| entry.is_broker() && entry.container_name_or(service) == name)
    }

    /// Every host port declared by any service.
    pub fn declared_ports(&self) -> BTreeSet<u16> {
        self.services
            .values()
            .flat_map(ServiceEntry::host_ports)
            .collect()
    }

    /// Host port to the services that declare it.
    pub fn port_map(&self) -> IndexMap<u16, Vec<String>> {
        let mut map: IndexMap<u16, Vec<String>> = IndexMap::new();
        for (service, entry) in &self.services {
            for port in entry.host_ports() {
                map.entry(port).or_default().push(service.clone());
            }
        }
        map.sort_keys();
        map
    }

    /// Physical name of a top-level volume.
    pub fn volume_physical_name(&self, key: &str, project: &str) -> String {
        match self.volumes.get(key) {
            Some(Some(entry)) => {
                if let Some(name) = &entry.name {
                    return name.clone();
                }
                if entry.extra.get("external").and_then(Value::as_bool) == Some(true) {
                    return key.to_owned();
                }
                format!("{project}_{key}")
            }
            _ => format!("{project}_{key}"),
        }
    }

    /// Physical names of every declared top-level volume.
    pub fn declared_volume_names(&self, project: &str) -> BTreeSet<String> {
        self.volumes
            .keys()
            .map(|key| self.volume_physical_name(key, project))
            .collect()
    }

    /// Remove a broker's service entry and any volume declarations only it used.
    ///
    /// Returns the physical names of the volumes whose declarations were dropped.
    pub fn remove_broker(&mut self, name: &str, project: &str) -> Option<Vec<String>> {
        let service = self.broker_entry(name)?.0.clone();
        let entry = self.services.shift_remove(&service)?;
        let still_used: BTreeSet<String> = self
            .services
            .values()
            .flat_map(ServiceEntry::named_volumes)
            .collect();
        let mut dropped = Vec::new();
        for volume in entry.named_volumes() {
            if still_used.contains(&volume) || !self.volumes.contains_key(&volume) {
                continue;
            }
            dropped.push(self.volume_physical_name(&volume, project));
            self.volumes.shift_remove(&volume);
        }
        Some(dropped)
    }

    /// Built-in default service set: ZooKeeper, the baseline brokers, the topic
    /// browser, the control panel and the notebook server.
    pub fn baseline(settings: &ClusterConfig, project: &str) -> Self {
        let mut description = OrchestrationDescription::default();
        description
            .extra
            .insert("version".to_owned(), Value::String("3.8".to_owned()));

        let mut zookeeper = ServiceEntry {
            image: Some("confluentinc/cp-zookeeper:7.5.0".to_owned()),
            container_name: Some(ZOOKEEPER_SERVICE.to_owned()),
            hostname: Some(ZOOKEEPER_SERVICE.to_owned()),
            ports: vec![Value::String("2181:2181".to_owned())],
            volumes: vec![
                Value::String("zookeeper-data:/var/lib/zookeeper/data".to_owned()),
                Value::String("zookeeper-logs:/var/lib/zookeeper/log".to_owned()),
            ],
            ..ServiceEntry::default()
        };
        zookeeper
            .environment
            .insert("ZOOKEEPER_CLIENT_PORT".to_owned(), Value::from(2181));
        zookeeper
            .environment
            .insert("ZOOKEEPER_TICK_TIME".to_owned(), Value::from(2000));
        label_infra(&mut zookeeper);
        description
            .services
            .insert(ZOOKEEPER_SERVICE.to_owned(), zookeeper);
        for key in ["zookeeper-data", "zookeeper-logs"] {
            description
                .volumes
                .insert(key.to_owned(), Some(named_volume(key, project)));
        }

        let mut bootstrap = Vec::new();
        for ordinal in 1..=u32::from(settings.baseline_brokers) {
            let name = broker_name(DEFAULT_CLUSTER_ID, ordinal);
            let port = settings.base_port + (ordinal - 1) as u16;
            let blueprint = BrokerBlueprint {
                name: &name,
                cluster_id: DEFAULT_CLUSTER_ID,
                ordinal,
                host_port: port,
            };
            description.insert_broker(&blueprint, None, settings, project);
            bootstrap.push(format!("{name}:{}", settings.internal_port));
        }

        let mut topic_ui = ServiceEntry {
            image: Some("provectuslabs/kafka-ui:latest".to_owned()),
            container_name: Some("kafka-ui".to_owned()),
            ports: vec![Value::String("8080:8080".to_owned())],
            depends_on: Some(Value::Sequence(vec![Value::String(
                broker_name(DEFAULT_CLUSTER_ID, 1),
            )])),
            ..ServiceEntry::default()
        };
        topic_ui.environment.insert(
            "KAFKA_CLUSTERS_0_NAME".to_owned(),
            Value::String(DEFAULT_CLUSTER_ID.to_owned()),
        );
        topic_ui.environment.insert(
            "KAFKA_CLUSTERS_0_BOOTSTRAPSERVERS".to_owned(),
            Value::String(bootstrap.join(",")),
        );
        label_infra(&mut topic_ui);
        description.services.insert("kafka-ui".to_owned(), topic_ui);

        let mut control_panel = ServiceEntry {
            image: Some("kafka-playground/kpgd:latest".to_owned()),
            container_name: Some("control-panel".to_owned()),
            ports: vec![Value::String("5000:5000".to_owned())],
            volumes: vec![
                Value::String("/var/run/docker.sock:/var/run/docker.sock".to_owned()),
                Value::String("./docker-compose.yml:/app/docker-compose.yml".to_owned()),
            ],
            ..ServiceEntry::default()
        };
        control_panel.environment.insert(
            "KPG__RUNTIME__COMPOSE_FILE".to_owned(),
            Value::String("/app/docker-compose.yml".to_owned()),
        );
        label_infra(&mut control_panel);
        description
            .services
            .insert("control-panel".to_owned(), control_panel);

        let mut notebooks = ServiceEntry {
            image: Some("jupyter/minimal-notebook:latest".to_owned()),
            container_name: Some("jupyter".to_owned()),
            ports: vec![Value::String("8888:8888".to_owned())],
            volumes: vec![Value::String("notebooks:/home/jovyan/work".to_owned())],
            ..ServiceEntry::default()
        };
        label_infra(&mut notebooks);
        description.services.insert("jupyter".to_owned(), notebooks);
        description
            .volumes
            .insert("notebooks".to_owned(), Some(named_volume("notebooks", project)));

        description
    }

    /// Append a broker service and its data volume declaration.
    pub fn insert_broker(
        &mut self,
        blueprint: &BrokerBlueprint<'_>,
        template: Option<&ServiceEntry>,
        settings: &ClusterConfig,
        project: &str,
    ) {
        let entry = broker_entry(blueprint, template, settings);
        let volume_key = data_volume_key(blueprint.name);
        self.services.insert(blueprint.name.to_owned(), entry);
        self.volumes
            .insert(volume_key.clone(), Some(named_volume(&volume_key, project)));
    }
}

fn label_infra(entry: &mut ServiceEntry) {
    entry
        .labels
        .insert(ROLE_LABEL.to_owned(), Some(ServiceRole::Infra.as_str().to_owned()));
}

fn named_volume(key: &str, project: &str) -> VolumeEntry {
    VolumeEntry {
        name: Some(format!("{project}-{key}")),
        extra: IndexMap::new(),
    }
}

/// Deterministic container name for a broker.
pub fn broker_name(cluster_id: &str, ordinal: u32) -> String {
    if cluster_id == DEFAULT_CLUSTER_ID {
        format!("kafka{ordinal}")
    } else {
        format!("kafka-{cluster_id}-{ordinal}")
    }
}

pub fn data_volume_key(broker: &str) -> String {
    format!("{broker}-data")
}

/// ZooKeeper connect string, chrooted per non-default cluster.
pub fn zookeeper_connect_for(settings: &ClusterConfig, cluster_id: &str) -> String {
    if cluster_id == DEFAULT_CLUSTER_ID {
        settings.zookeeper_connect.clone()
    } else {
        format!("{}/{cluster_id}", settings.zookeeper_connect)
    }
}

/// Identity of a broker about to be declared.
#[derive(Debug, Clone, Copy)]
pub struct BrokerBlueprint<'a> {
    pub name: &'a str,
    pub cluster_id: &'a str,
    pub ordinal: u32,
    pub host_port: u16,
}

/// Build a broker service entry, cloning `template` when one is given.
pub fn broker_entry(
    blueprint: &BrokerBlueprint<'_>,
    template: Option<&ServiceEntry>,
    settings: &ClusterConfig,
) -> ServiceEntry {
    let mut entry = match template {
        Some(template) => template.clone(),
        None => builtin_broker_template(settings),
    };
    let name = blueprint.name;

    entry.container_name = Some(name.to_owned());
    entry.hostname = Some(name.to_owned());
    entry.ports = vec![Value::String(format!(
        "{}:{}",
        blueprint.host_port, settings.container_port
    ))];

    entry
        .environment
        .insert("KAFKA_BROKER_ID".to_owned(), Value::from(blueprint.ordinal));
    entry.environment.insert(
        "KAFKA_ZOOKEEPER_CONNECT".to_owned(),
        Value::String(zookeeper_connect_for(settings, blueprint.cluster_id)),
    );
    entry.environment.insert(
        "KAFKA_ADVERTISED_LISTENERS".to_owned(),
        Value::String(format!(
            "PLAINTEXT://{name}:{},PLAINTEXT_HOST://{}:{}",
            settings.internal_port, settings.advertised_host, blueprint.host_port
        )),
    );

    let mut volumes: Vec<Value> = entry
        .volumes
        .drain(..)
        .filter(|mount| named_volume_of(mount).is_none())
        .collect();
    volumes.push(Value::String(format!(
        "{}:{BROKER_DATA_DIR}",
        data_volume_key(name)
    )));
    entry.volumes = volumes;
    entry.depends_on = Some(Value::Sequence(vec![Value::String(
        ZOOKEEPER_SERVICE.to_owned(),
    )]));

    entry
        .labels
        .insert(ROLE_LABEL.to_owned(), Some(ServiceRole::Broker.as_str().to_owned()));
    entry
        .labels
        .insert(CLUSTER_LABEL.to_owned(), Some(blueprint.cluster_id.to_owned()));
    entry
        .labels
        .insert(ORDINAL_LABEL.to_owned(), Some(blueprint.ordinal.to_string()));
    entry
}

fn builtin_broker_template(settings: &ClusterConfig) -> ServiceEntry {
    let mut entry = ServiceEntry {
        image: Some(settings.broker_image.clone()),
        ..ServiceEntry::default()
    };
    let env = &mut entry.environment;
    env.insert(
        "KAFKA_LISTENERS".to_owned(),
        Value::String(format!(
            "PLAINTEXT://0.0.0.0:{},PLAINTEXT_HOST://0.0.0.0:{}",
            settings.internal_port, settings.container_port
        )),
    );
    env.insert(
        "KAFKA_LISTENER_SECURITY_PROTOCOL_MAP".to_owned(),
        Value::String("PLAINTEXT:PLAINTEXT,PLAINTEXT_HOST:PLAINTEXT".to_owned()),
    );
    env.insert(
        "KAFKA_INTER_BROKER_LISTENER_NAME".to_owned(),
        Value::String("PLAINTEXT".to_owned()),
    );
    env.insert(
        "KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR".to_owned(),
        Value::from(1),
    );
    env.insert(
        "KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR".to_owned(),
        Value::from(1),
    );
    env.insert(
        "KAFKA_TRANSACTION_STATE_LOG_MIN_ISR".to_owned(),
        Value::from(1),
    );
    env.insert(
        "KAFKA_AUTO_CREATE_TOPICS_ENABLE".to_owned(),
        Value::String("true".to_owned()),
    );
    entry
}

/// File guards keyed by path, shared by every store handle on the same file.
type FileGuards = Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>;

static FILE_GUARDS: Lazy<FileGuards> = Lazy::new(Default::default);

fn file_guard(path: &Path) -> Arc<RwLock<()>> {
    FILE_GUARDS
        .lock()
        .entry(path.to_path_buf())
        .or_default()
        .clone()
}

/// Reads and writes the description file in place.
///
/// The file is truncated and rewritten rather than replaced, so readers take
/// a shared guard and never observe a partially written document.
#[derive(Debug, Clone)]
pub struct DescriptionStore {
    path: PathBuf,
    guard: Arc<RwLock<()>>,
}

impl DescriptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let guard = file_guard(&path);
        Self { path, guard }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read_raw(&self) -> Result<String> {
        let _shared = self.guard.read();
        Ok(fs::read_to_string(&self.path)?)
    }

    pub fn read(&self) -> Result<OrchestrationDescription> {
        let raw = self.read_raw()?;
        self.parse_raw(&raw)
    }

    fn parse_raw(&self, raw: &str) -> Result<OrchestrationDescription> {
        parse(raw).map_err(|err| {
            ControlPlaneError::MalformedDescription(format!("{}: {err}", self.path.display()))
        })
    }

    /// Truncate and rewrite the file without replacing it, then verify that
    /// the bytes on disk parse back into the same document.
    pub fn write(&self, description: &OrchestrationDescription) -> Result<()> {
        let rendered = serde_yaml::to_string(description).map_err(|err| {
            ControlPlaneError::MalformedDescription(format!("unable to render description: {err}"))
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let persisted = {
            let _exclusive = self.guard.write();
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            file.set_len(0)?;
            file.write_all(rendered.as_bytes())?;
            file.sync_all()?;
            drop(file);
            fs::read_to_string(&self.path)?
        };

        if &self.parse_raw(&persisted)? != description {
            return Err(ControlPlaneError::MalformedDescription(format!(
                "{} does not read back as the document that was written",
                self.path.display()
            )));
        }
        debug!(
            path = %self.path.display(),
            services = description.services.len(),
            "orchestration description persisted"
        );
        Ok(())
    }

    /// Write `baseline` when no description exists yet.
    pub fn initialize_if_missing(&self, baseline: &OrchestrationDescription) -> Result<bool> {
        if self.exists() {
            return Ok(false);
        }
        self.write(baseline)?;
        Ok(true)
    }
}

/// Parse a compose document. Empty documents and documents without a
/// `services` mapping are rejected.
pub fn parse(raw: &str) -> std::result::Result<OrchestrationDescription, serde_yaml::Error> {
    use serde::de::Error as _;

    let document: Value = serde_yaml::from_str(raw)?;
    match &document {
        Value::Mapping(root) => match root.get("services") {
            Some(Value::Mapping(_)) => {}
            Some(_) => return Err(serde_yaml::Error::custom("`services` must be a mapping")),
            None => return Err(serde_yaml::Error::custom("document has no `services` mapping")),
        },
        Value::Null => return Err(serde_yaml::Error::custom("document is empty")),
        _ => return Err(serde_yaml::Error::custom("document root must be a mapping")),
    }
    serde_yaml::from_str(raw)
}
