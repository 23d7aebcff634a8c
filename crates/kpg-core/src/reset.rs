//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Restores the environment to the baseline service set."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::description::{OrchestrationDescription, ServiceRole};
use crate::error::Result;
use crate::registry::ClusterRegistry;
use crate::runtime::{tolerate_missing, ContainerRuntime};
use crate::scope::MutationScope;

/// Returns the environment to the baseline description.
pub struct ResetCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    baseline: OrchestrationDescription,
    preserved: BTreeSet<String>,
    project: String,
}

impl ResetCoordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        baseline: OrchestrationDescription,
        preserved: impl IntoIterator<Item = String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            baseline,
            preserved: preserved.into_iter().collect(),
            project: project.into(),
        }
    }

    fn in_managed_scope(&self, volume: &str) -> bool {
        volume.starts_with(&format!("{}-", self.project))
            || volume.starts_with(&format!("{}_", self.project))
    }

    /// Run the five reset phases and return what each one did.
    ///
    /// Ignores the mutation halt: this is the recovery path after a malformed
    /// description.
    pub async fn reset(
        &self,
        scope: &mut MutationScope<'_>,
        registry: &ClusterRegistry,
    ) -> Result<Vec<String>> {
        let mut actions = Vec::new();

        let current = scope.read_lenient()?;
        let containers = self.runtime.list_containers().await?;
        let mut brokers: BTreeSet<String> = current
            .as_ref()
            .map(|description| {
                description
                    .brokers()
                    .into_iter()
                    .map(|broker| broker.name)
                    .collect()
            })
            .unwrap_or_default();
        brokers.extend(
            containers
                .values()
                .filter(|container| container.role() == ServiceRole::Broker)
                .map(|container| container.name.clone()),
        );
        let mut removed_containers = 0;
        for name in &brokers {
            let Some(container) = containers.get(name) else {
                continue;
            };
            if container.status.is_running() {
                tolerate_missing(self.runtime.stop(name).await)?;
            }
            if tolerate_missing(self.runtime.remove(name).await)? {
                removed_containers += 1;
                actions.push(format!("Stopped and removed broker container {name}"));
            }
        }
        if removed_containers == 0 {
            actions.push("No broker containers to remove".to_owned());
        }

        scope.restore(&self.baseline)?;
        actions.push(format!(
            "Restored orchestration description to the default service set ({} services)",
            self.baseline.services.len()
        ));

        let dropped = registry.retain_default()?;
        if dropped.is_empty() {
            actions.push("No custom clusters to remove".to_owned());
        } else {
            actions.push(format!("Removed clusters: {}", dropped.join(", ")));
        }

        let keep = self.baseline.declared_volume_names(&self.project);
        let mut removed_volumes = 0;
        for volume in self.runtime.list_volumes().await? {
            if !self.in_managed_scope(&volume) || keep.contains(&volume) {
                continue;
            }
            if self.preserved.contains(&volume) {
                actions.push(format!("Preserved volume {volume}"));
                continue;
            }
            if tolerate_missing(self.runtime.remove_volume(&volume).await)? {
                removed_volumes += 1;
                actions.push(format!("Removed volume {volume}"));
            } else {
                warn!(volume = %volume, "volume vanished during reset");
            }
        }
        if removed_volumes == 0 {
            actions.push("No custom volumes to remove".to_owned());
        }
        for volume in &self.preserved {
            if keep.contains(volume) {
                actions.push(format!("Preserved volume {volume}"));
            }
        }

        self.runtime.up(&[]).await?;
        actions.push("Started the default service set".to_owned());

        info!(
            brokers_removed = removed_containers,
            volumes_removed = removed_volumes,
            clusters_removed = dropped.len(),
            "environment reset"
        );
        Ok(actions)
    }
}
