//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Cluster registry, broker lifecycle, topic gateway and reset coordination."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
//! Control plane for a local multi-broker Kafka playground.
//!
//! The orchestration description (a compose file) is the single source of
//! truth for which brokers exist. [`ControlPlane`] serialises every mutation
//! of it and drives the container runtime and Kafka admin client from there.

pub mod broker;
pub mod description;
pub mod error;
pub mod plane;
pub mod ports;
pub mod registry;
pub mod reset;
pub mod runtime;
pub mod scope;
pub mod topics;

pub use broker::{BrokerState, BrokerStatus, ProvisionedBroker, RemovedBroker};
pub use description::{DescriptionStore, OrchestrationDescription, ServiceRole};
pub use error::{BrokerFailure, ControlPlaneError, LifecycleStep, Result};
pub use plane::{
    ClusterDeletion, ClusterStatus, ContainerView, ControlPlane, ControlPlaneBuilder,
    ValidationReport,
};
pub use registry::{Cluster, ClusterBroker, ClusterRecord, ClusterRegistry};
pub use runtime::{ContainerRuntime, ContainerStatus, DockerRuntime, SimulatedRuntime};
pub use topics::{KafkaTopicAdmin, SimulatedTopicAdmin, TopicAdmin, TopicInfo, TopicSpec};
