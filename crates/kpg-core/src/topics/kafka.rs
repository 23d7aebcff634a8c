//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Topic admin over librdkafka."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::debug;

use super::{AdminTarget, TopicAdmin, TopicAdminError, TopicInfo, TopicSpec};

type Admin = AdminClient<DefaultClientContext>;

/// Talks to brokers with an rdkafka [`AdminClient`].
///
/// librdkafka calls block, so every request runs on the blocking pool with a
/// client built for that request's bootstrap list.
#[derive(Debug, Clone)]
pub struct KafkaTopicAdmin {
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(target: &AdminTarget, timeout: Duration) -> Result<Admin, TopicAdminError> {
        ClientConfig::new()
            .set("bootstrap.servers", target.bootstrap.join(","))
            .set("client.id", format!("kpg-admin-{}", target.cluster_id))
            .set("socket.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(|err| TopicAdminError::Unreachable(format!("while creating admin client: {err}")))
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .operation_timeout(Some(Timeout::After(self.timeout)))
            .request_timeout(Some(Timeout::After(self.timeout)))
    }

    async fn blocking<T, F>(task: F) -> Result<T, TopicAdminError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TopicAdminError> + Send + 'static,
    {
        tokio::task::spawn_blocking(task)
            .await
            .map_err(|err| TopicAdminError::Unreachable(format!("admin task failed: {err}")))?
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn list_topics(&self, target: &AdminTarget) -> Result<Vec<TopicInfo>, TopicAdminError> {
        let target = target.clone();
        let timeout = self.timeout;
        Self::blocking(move || {
            let admin = Self::client(&target, timeout)?;
            let metadata = admin
                .inner()
                .fetch_metadata(None, Timeout::After(timeout))
                .map_err(|err| TopicAdminError::Unreachable(format!("while fetching metadata: {err}")))?;
            let topics = metadata
                .topics()
                .iter()
                .map(|topic| TopicInfo {
                    name: topic.name().to_owned(),
                    partitions: topic.partitions().len() as u32,
                })
                .collect::<Vec<_>>();
            debug!(cluster = %target.cluster_id, topics = topics.len(), "metadata fetched");
            Ok(topics)
        })
        .await
    }

    async fn create_topic(&self, target: &AdminTarget, spec: &TopicSpec) -> Result<(), TopicAdminError> {
        let target = target.clone();
        let spec = spec.clone();
        let timeout = self.timeout;
        let options = self.options();
        Self::blocking(move || {
            let admin = Self::client(&target, timeout)?;
            let topic = NewTopic::new(
                &spec.name,
                spec.partitions,
                TopicReplication::Fixed(spec.replication_factor),
            );
            let results = futures::executor::block_on(admin.create_topics([&topic], &options))
                .map_err(|err| TopicAdminError::Unreachable(format!("while creating topic: {err}")))?;
            for result in results {
                match result {
                    Ok(_) => {}
                    Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        return Err(TopicAdminError::AlreadyExists(name))
                    }
                    Err((name, code)) => {
                        return Err(TopicAdminError::Rejected(format!("{name}: {code}")))
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete_topic(&self, target: &AdminTarget, name: &str) -> Result<(), TopicAdminError> {
        let target = target.clone();
        let name = name.to_owned();
        let timeout = self.timeout;
        let options = self.options();
        Self::blocking(move || {
            let admin = Self::client(&target, timeout)?;
            let results = futures::executor::block_on(admin.delete_topics(&[name.as_str()], &options))
                .map_err(|err| TopicAdminError::Unreachable(format!("while deleting topic: {err}")))?;
            for result in results {
                match result {
                    Ok(_) => {}
                    Err((
                        topic,
                        RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic,
                    )) => return Err(TopicAdminError::UnknownTopic(topic)),
                    Err((topic, code)) => {
                        return Err(TopicAdminError::Rejected(format!("{topic}: {code}")))
                    }
                }
            }
            Ok(())
        })
        .await
    }
}
