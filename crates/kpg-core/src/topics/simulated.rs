//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "In-memory topic admin keyed by cluster."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AdminTarget, TopicAdmin, TopicAdminError, TopicInfo, TopicSpec};

const OFFSETS_TOPIC: &str = "__consumer_offsets";
const OFFSETS_PARTITIONS: u32 = 50;

/// Topic store used by the simulated mode and tests.
///
/// Each cluster starts with the internal offsets topic, as a real broker does.
#[derive(Debug, Default)]
pub struct SimulatedTopicAdmin {
    clusters: Mutex<HashMap<String, BTreeMap<String, TopicInfo>>>,
}

impl SimulatedTopicAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_cluster<T>(&self, target: &AdminTarget, f: impl FnOnce(&mut BTreeMap<String, TopicInfo>) -> T) -> T {
        let mut clusters = self.clusters.lock();
        let topics = clusters.entry(target.cluster_id.clone()).or_insert_with(|| {
            let mut topics = BTreeMap::new();
            topics.insert(
                OFFSETS_TOPIC.to_owned(),
                TopicInfo {
                    name: OFFSETS_TOPIC.to_owned(),
                    partitions: OFFSETS_PARTITIONS,
                },
            );
            topics
        });
        f(topics)
    }

    fn reachable(target: &AdminTarget) -> Result<(), TopicAdminError> {
        if target.bootstrap.is_empty() {
            return Err(TopicAdminError::Unreachable(format!(
                "no bootstrap servers for cluster '{}'",
                target.cluster_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for SimulatedTopicAdmin {
    async fn list_topics(&self, target: &AdminTarget) -> Result<Vec<TopicInfo>, TopicAdminError> {
        Self::reachable(target)?;
        Ok(self.with_cluster(target, |topics| topics.values().cloned().collect()))
    }

    async fn create_topic(&self, target: &AdminTarget, spec: &TopicSpec) -> Result<(), TopicAdminError> {
        Self::reachable(target)?;
        self.with_cluster(target, |topics| {
            if topics.contains_key(&spec.name) {
                return Err(TopicAdminError::AlreadyExists(spec.name.clone()));
            }
            topics.insert(
                spec.name.clone(),
                TopicInfo {
                    name: spec.name.clone(),
                    partitions: spec.partitions.max(1) as u32,
                },
            );
            Ok(())
        })
    }

    async fn delete_topic(&self, target: &AdminTarget, name: &str) -> Result<(), TopicAdminError> {
        Self::reachable(target)?;
        self.with_cluster(target, |topics| {
            topics
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| TopicAdminError::UnknownTopic(name.to_owned()))
        })
    }
}
