//! ---
//! kpg_section: "02-configuration-logging"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Configuration model and layered loading for the control plane."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("/app/docker-compose.yml")
}

fn default_project_name() -> String {
    "kafka-playground".to_owned()
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_owned(), "compose".to_owned()]
}

fn default_base_port() -> u16 {
    9092
}

fn default_port_search_limit() -> u16 {
    1000
}

fn default_container_port() -> u16 {
    9092
}

fn default_internal_port() -> u16 {
    29092
}

fn default_advertised_host() -> String {
    "localhost".to_owned()
}

fn default_broker_image() -> String {
    "confluentinc/cp-kafka:7.5.0".to_owned()
}

fn default_zookeeper_connect() -> String {
    "zookeeper:2181".to_owned()
}

fn default_baseline_brokers() -> u16 {
    3
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/clusters.json")
}

fn default_preserved_volumes() -> Vec<String> {
    vec!["kafka-playground-notebooks".to_owned()]
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Primary configuration object for the control plane daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub reset: ResetConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "KPG_CONFIG";
    pub const ENV_PREFIX: &'static str = "KPG";

    /// Load configuration from disk, respecting the `KPG_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the file it came from.
    ///
    /// Resolution order is `KPG_CONFIG`, then the first existing candidate.
    /// When no file exists the built-in defaults are used. In every case
    /// `KPG__SECTION__KEY` environment variables are layered on top.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let mut source = None;
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                if !path.exists() {
                    return Err(anyhow!(
                        "{} points at missing file {}",
                        Self::ENV_CONFIG_PATH,
                        path.display()
                    ));
                }
                source = Some(path);
            }
        }

        if source.is_none() {
            source = candidates
                .iter()
                .map(|candidate| candidate.as_ref())
                .find(|candidate| candidate.exists())
                .map(Path::to_path_buf);
        }

        let config = Self::build(source.as_deref())?;
        Ok(LoadedAppConfig { config, source })
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(config_path = %path.display(), "loading configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let layered = builder
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("while building layered configuration")?;

        let config: AppConfig = layered
            .try_deserialize()
            .context("while deserialising configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        self.cluster.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

/// Which container runtime backs the control plane.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Docker engine plus the compose CLI.
    #[default]
    Docker,
    /// In-memory runtime and topic admin; nothing leaves the process.
    Simulated,
}

impl RuntimeMode {
    pub fn is_simulated(&self) -> bool {
        matches!(self, RuntimeMode::Simulated)
    }
}

impl std::str::FromStr for RuntimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeMode::Docker),
            "simulated" => Ok(RuntimeMode::Simulated),
            other => Err(format!("unknown runtime mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mode: RuntimeMode,
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Working directory for compose invocations; defaults to the compose file's parent.
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,
    /// Number of status polls a simulated container spends in `created`.
    #[serde(default)]
    pub startup_polls: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            compose_file: default_compose_file(),
            project_name: default_project_name(),
            project_dir: None,
            compose_command: default_compose_command(),
            startup_polls: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project_name.is_empty()
            || !self
                .project_name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(anyhow!(
                "runtime project_name '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.project_name
            ));
        }
        if self.compose_command.is_empty() {
            return Err(anyhow!("runtime compose_command must name a program"));
        }
        Ok(())
    }

    /// Directory compose commands run from.
    pub fn effective_project_dir(&self) -> PathBuf {
        self.project_dir.clone().unwrap_or_else(|| {
            self.compose_file
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

/// How bootstrap endpoints are rendered for admin clients and status output.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStyle {
    /// `{advertised_host}:{host_port}`, reachable from the host machine.
    #[default]
    Host,
    /// `{broker_name}:{internal_port}`, reachable inside the compose network.
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_port_search_limit")]
    pub port_search_limit: u16,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,
    #[serde(default)]
    pub endpoint_style: EndpointStyle,
    #[serde(default = "default_broker_image")]
    pub broker_image: String,
    #[serde(default = "default_zookeeper_connect")]
    pub zookeeper_connect: String,
    #[serde(default = "default_baseline_brokers")]
    pub baseline_brokers: u16,
    /// Host ports that are never handed to a broker.
    #[serde(default)]
    pub reserved_ports: Vec<u16>,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_search_limit: default_port_search_limit(),
            container_port: default_container_port(),
            internal_port: default_internal_port(),
            advertised_host: default_advertised_host(),
            endpoint_style: EndpointStyle::default(),
            broker_image: default_broker_image(),
            zookeeper_connect: default_zookeeper_connect(),
            baseline_brokers: default_baseline_brokers(),
            reserved_ports: Vec::new(),
            state_path: default_state_path(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            return Err(anyhow!("cluster base_port must be non-zero"));
        }
        if self.port_search_limit == 0 {
            return Err(anyhow!("cluster port_search_limit must be greater than zero"));
        }
        if self.baseline_brokers == 0 {
            return Err(anyhow!(
                "cluster baseline_brokers must be at least 1 so the default cluster has a broker"
            ));
        }
        if self.base_port.checked_add(self.baseline_brokers).is_none() {
            return Err(anyhow!(
                "baseline brokers starting at {} overflow the port range",
                self.base_port
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Compose file holding the default service set. Built-in baseline when unset.
    #[serde(default)]
    pub baseline_file: Option<PathBuf>,
    /// Physical volume names reset must never remove.
    #[serde(default = "default_preserved_volumes")]
    pub preserved_volumes: Vec<String>,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            baseline_file: None,
            preserved_volumes: default_preserved_volumes(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Also probe host ports with a TCP connect during config validation.
    #[serde(default)]
    pub probe_host_ports: bool,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            probe_host_ports: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config.cluster.base_port, 9092);
        assert_eq!(config.cluster.baseline_brokers, 3);
        assert_eq!(config.runtime.mode, RuntimeMode::Docker);
        assert_eq!(config.topics.request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.reset.preserved_volumes,
            vec!["kafka-playground-notebooks".to_owned()]
        );
    }

    #[test]
    fn sections_override_defaults() {
        let config = AppConfig::from_str(
            r#"
            [runtime]
            mode = "simulated"
            project_name = "sandbox"

            [cluster]
            base_port = 19092
            endpoint_style = "internal"

            [topics]
            request_timeout = 12
            "#,
        )
        .unwrap();
        assert!(config.runtime.mode.is_simulated());
        assert_eq!(config.runtime.project_name, "sandbox");
        assert_eq!(config.cluster.base_port, 19092);
        assert_eq!(config.cluster.endpoint_style, EndpointStyle::Internal);
        assert_eq!(config.topics.request_timeout, Duration::from_secs(12));
    }

    #[test]
    fn rejects_zero_baseline() {
        let err = AppConfig::from_str("[cluster]\nbaseline_brokers = 0\n").unwrap_err();
        assert!(err.to_string().contains("baseline_brokers"));
    }

    #[test]
    fn rejects_unsafe_project_name() {
        let err = AppConfig::from_str("[runtime]\nproject_name = \"my project\"\n").unwrap_err();
        assert!(err.to_string().contains("project_name"));
    }

    #[test]
    fn project_dir_falls_back_to_compose_parent() {
        let runtime = RuntimeConfig {
            compose_file: PathBuf::from("/srv/playground/docker-compose.yml"),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            runtime.effective_project_dir(),
            PathBuf::from("/srv/playground")
        );
    }

    #[test]
    fn runtime_mode_parses_case_insensitively() {
        assert_eq!(
            RuntimeMode::from_str("Simulated").unwrap(),
            RuntimeMode::Simulated
        );
        assert!(RuntimeMode::from_str("podman").is_err());
    }
}
