//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Docker engine runtime backed by bollard and the compose CLI."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::container::{
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use tokio::process::Command;
use tracing::{debug, info};

use kpg_common::config::RuntimeConfig;

use super::{
    ContainerInfo, ContainerMap, ContainerRuntime, ContainerStatus, RuntimeError,
    COMPOSE_PROJECT_LABEL,
};

const STOP_GRACE_SECONDS: i64 = 10;

/// Runtime talking to the local Docker engine.
///
/// Container and volume calls go straight to the engine API; service creation
/// goes through the compose CLI so the description stays the only source of
/// container configuration.
pub struct DockerRuntime {
    docker: Docker,
    compose: ComposeCli,
    project: String,
}

impl DockerRuntime {
    pub fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| RuntimeError::Unavailable(format!("docker connect failed: {err}")))?;
        Ok(Self {
            docker,
            compose: ComposeCli::from_config(config),
            project: config.project_name.clone(),
        })
    }

    fn project_filter(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_owned(),
            vec![format!("{COMPOSE_PROJECT_LABEL}={}", self.project)],
        );
        filters
    }
}

fn map_error(target: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_owned()),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

/// 304 means the container is already in the requested state.
fn accept_not_modified(target: &str, result: Result<(), DockerError>) -> Result<(), RuntimeError> {
    match result {
        Ok(()) => Ok(()),
        Err(DockerError::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        Err(err) => Err(map_error(target, err)),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<ContainerMap, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: self.project_filter(),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;

        let mut containers = ContainerMap::new();
        for summary in summaries {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_owned())
            else {
                continue;
            };
            let status = summary
                .state
                .as_deref()
                .map(ContainerStatus::parse)
                .unwrap_or(ContainerStatus::Unknown);
            let labels = summary.labels.unwrap_or_default().into_iter().collect();
            containers.insert(
                name.clone(),
                ContainerInfo {
                    name,
                    status,
                    labels,
                },
            );
        }
        Ok(containers)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        debug!(container = name, "starting container");
        let result = self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await;
        accept_not_modified(name, result)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        debug!(container = name, "stopping container");
        let result = self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECONDS,
                }),
            )
            .await;
        accept_not_modified(name, result)
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        debug!(container = name, "removing container");
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| map_error(name, err))
    }

    async fn up(&self, services: &[String]) -> Result<(), RuntimeError> {
        let mut args = vec!["up".to_owned(), "-d".to_owned()];
        if services.is_empty() {
            args.push("--remove-orphans".to_owned());
        } else {
            args.extend(services.iter().cloned());
        }
        self.compose.run(&args).await
    }

    async fn list_volumes(&self) -> Result<Vec<String>, RuntimeError> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        let mut names: Vec<String> = response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        debug!(volume = name, "removing volume");
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|err| map_error(name, err))
    }
}

/// Invocation of the compose CLI for one project.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    command: Vec<String>,
    file: PathBuf,
    project: String,
    directory: PathBuf,
}

impl ComposeCli {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            command: config.compose_command.clone(),
            file: config.compose_file.clone(),
            project: config.project_name.clone(),
            directory: config.effective_project_dir(),
        }
    }

    fn args_for(&self, args: &[String]) -> Vec<String> {
        let mut full: Vec<String> = self.command.iter().skip(1).cloned().collect();
        full.push("-f".to_owned());
        full.push(self.file.display().to_string());
        full.push("-p".to_owned());
        full.push(self.project.clone());
        full.extend(args.iter().cloned());
        full
    }

    pub async fn run(&self, args: &[String]) -> Result<(), RuntimeError> {
        let Some(program) = self.command.first() else {
            return Err(RuntimeError::Unavailable(
                "no compose command configured".to_owned(),
            ));
        };
        let full = self.args_for(args);
        info!(program = %program, args = ?full, "invoking compose");
        let output = Command::new(program)
            .args(&full)
            .current_dir(&self.directory)
            .output()
            .await
            .map_err(|err| RuntimeError::Unavailable(format!("failed to launch {program}: {err}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let missing_service = stderr.contains("no such service");
        let message = format!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        );
        if missing_service {
            Err(RuntimeError::NotFound(message))
        } else {
            Err(RuntimeError::Unavailable(message))
        }
    }
}
