//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "tests"
//! kpg_type: "source"
//! kpg_scope: "test"
//! kpg_description: "End-to-end lifecycle tests against the simulated runtime."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kpg_common::config::{AppConfig, RuntimeMode};
use kpg_core::runtime::ContainerRuntime;
use kpg_core::{
    BrokerState, ContainerStatus, ControlPlane, ControlPlaneError, DescriptionStore, SimulatedRuntime,
    SimulatedTopicAdmin, TopicSpec,
};
use serde_yaml::Value;
use tempfile::{tempdir, TempDir};

struct Playground {
    _dir: TempDir,
    runtime: Arc<SimulatedRuntime>,
    plane: Arc<ControlPlane>,
}

fn config_in(dir: &TempDir, startup_polls: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.runtime.mode = RuntimeMode::Simulated;
    config.runtime.compose_file = dir.path().join("docker-compose.yml");
    config.runtime.startup_polls = startup_polls;
    config.cluster.state_path = dir.path().join("state/clusters.json");
    config
}

fn playground_with(startup_polls: u32, registry: Option<kpg_metrics::SharedRegistry>) -> Playground {
    let dir = tempdir().expect("tempdir");
    let config = config_in(&dir, startup_polls);
    let runtime = Arc::new(SimulatedRuntime::new(
        DescriptionStore::new(&config.runtime.compose_file),
        config.runtime.project_name.clone(),
        startup_polls,
    ));
    let mut builder = ControlPlane::builder(&config)
        .runtime(runtime.clone())
        .topic_admin(Arc::new(SimulatedTopicAdmin::new()));
    if let Some(registry) = registry {
        builder = builder.metrics_registry(registry);
    }
    let plane = builder.build().expect("control plane");
    Playground {
        _dir: dir,
        runtime,
        plane: Arc::new(plane),
    }
}

async fn playground() -> Playground {
    let pg = playground_with(0, None);
    pg.plane.start_cluster(None).await.expect("baseline up");
    pg
}

fn topic(name: &str, partitions: i32, replication_factor: i32) -> TopicSpec {
    TopicSpec {
        name: name.to_owned(),
        partitions,
        replication_factor,
    }
}

#[tokio::test]
async fn add_delete_create_reset_walkthrough() {
    let pg = playground().await;

    let added = pg.plane.add_broker("default").await.unwrap();
    assert_eq!(added.name, "kafka4");
    assert_eq!(added.port, 9095);

    pg.plane.delete_broker("kafka2").await.unwrap();
    let default = pg.plane.get_cluster("default").unwrap();
    assert_eq!(default.broker_names(), vec!["kafka1", "kafka3", "kafka4"]);

    let beta = pg.plane.create_cluster("beta").await.unwrap();
    assert!(beta.brokers.is_empty());

    let first_beta = pg.plane.add_broker("beta").await.unwrap();
    assert_eq!(first_beta.name, "kafka-beta-1");
    assert_eq!(first_beta.port, 9096);
    assert!(pg
        .runtime
        .volume_names()
        .contains("kafka-playground-kafka-beta-1-data"));

    let actions = pg.plane.reset().await.unwrap();
    assert!(actions.iter().any(|action| action.contains("beta")));

    let clusters = pg.plane.list_clusters().unwrap();
    assert_eq!(clusters.len(), 1);
    let default = &clusters[0];
    assert_eq!(default.id, "default");
    assert_eq!(default.broker_names(), vec!["kafka1", "kafka2", "kafka3"]);
    let ports: Vec<_> = default.brokers.iter().map(|broker| broker.port).collect();
    assert_eq!(ports, vec![Some(9092), Some(9093), Some(9094)]);

    let volumes = pg.runtime.volume_names();
    assert!(volumes.contains("kafka-playground-notebooks"));
    assert!(!volumes.contains("kafka-playground-kafka4-data"));
    assert!(!volumes.contains("kafka-playground-kafka-beta-1-data"));
    assert!(pg.runtime.status_of("kafka-beta-1").is_none());
    assert!(pg.runtime.status_of("kafka2").unwrap().is_running());
}

#[tokio::test]
async fn reset_is_idempotent() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();
    pg.runtime.seed_volume("kafka-playground-scratch");
    pg.runtime.seed_volume("unrelated-volume");

    pg.plane.reset().await.unwrap();
    let description = pg.plane.store().read_raw().unwrap();
    let containers: BTreeSet<_> = pg.runtime.list_containers().await.unwrap().into_keys().collect();
    let volumes = pg.runtime.volume_names();
    let clusters = pg.plane.list_clusters().unwrap();

    pg.plane.reset().await.unwrap();
    assert_eq!(pg.plane.store().read_raw().unwrap(), description);
    assert_eq!(
        pg.runtime.list_containers().await.unwrap().into_keys().collect::<BTreeSet<_>>(),
        containers
    );
    assert_eq!(pg.runtime.volume_names(), volumes);
    assert_eq!(pg.plane.list_clusters().unwrap(), clusters);

    assert!(!volumes.contains("kafka-playground-scratch"));
    assert!(volumes.contains("unrelated-volume"));
}

#[tokio::test]
async fn reset_removes_undeclared_broker_containers() {
    let pg = playground().await;
    let labels = BTreeMap::from([
        ("kpg.role".to_owned(), "broker".to_owned()),
        ("kpg.cluster".to_owned(), "legacy".to_owned()),
    ]);
    pg.runtime
        .seed_container("kafka-legacy-1", ContainerStatus::Running, labels);
    let status = pg.plane.broker_status("kafka-legacy-1").await.unwrap();
    assert_eq!(status.state, BrokerState::Removing);

    let actions = pg.plane.reset().await.unwrap();
    assert!(actions
        .iter()
        .any(|action| action.contains("kafka-legacy-1")));
    assert!(pg.runtime.status_of("kafka-legacy-1").is_none());
    assert!(pg.runtime.status_of("kafka1").unwrap().is_running());
}

#[tokio::test]
async fn add_to_unknown_cluster_leaves_description_untouched() {
    let pg = playground().await;
    let before = pg.plane.store().read_raw().unwrap();
    let err = pg.plane.add_broker("ghost").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::ClusterNotFound(id) if id == "ghost"));
    assert_eq!(pg.plane.store().read_raw().unwrap(), before);
}

#[tokio::test]
async fn cluster_create_get_delete() {
    let pg = playground().await;
    let created = pg.plane.create_cluster("Analytics").await.unwrap();
    assert_eq!(created.id, "analytics");
    assert_eq!(pg.plane.get_cluster("ANALYTICS").unwrap().name, "Analytics");

    assert!(matches!(
        pg.plane.create_cluster("analytics").await,
        Err(ControlPlaneError::DuplicateCluster(_))
    ));
    assert!(matches!(
        pg.plane.create_cluster("bad name").await,
        Err(ControlPlaneError::InvalidClusterName { .. })
    ));

    let deleted = pg.plane.delete_cluster("analytics").await.unwrap();
    assert!(deleted.removed_brokers.is_empty());
    assert!(matches!(
        pg.plane.get_cluster("analytics"),
        Err(ControlPlaneError::ClusterNotFound(_))
    ));
    assert!(matches!(
        pg.plane.delete_cluster("default").await,
        Err(ControlPlaneError::CannotDeleteDefault)
    ));
}

#[tokio::test]
async fn ports_are_unique_across_clusters() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.create_cluster("gamma").await.unwrap();
    for cluster in ["beta", "default", "gamma", "beta", "gamma", "default"] {
        pg.plane.add_broker(cluster).await.unwrap();
    }

    let ports: Vec<u16> = pg
        .plane
        .list_clusters()
        .unwrap()
        .iter()
        .flat_map(|cluster| cluster.brokers.iter().filter_map(|broker| broker.port))
        .collect();
    let unique: BTreeSet<u16> = ports.iter().copied().collect();
    assert_eq!(ports.len(), 9);
    assert_eq!(unique.len(), ports.len());
    for infra in [2181, 5000, 8080, 8888] {
        assert!(!unique.contains(&infra));
    }
    assert!(pg.plane.validate_config().await.unwrap().valid);
}

#[tokio::test]
async fn deleted_broker_port_is_reused() {
    let pg = playground().await;
    let first = pg.plane.add_broker("default").await.unwrap();
    let removed = pg.plane.delete_broker(&first.name).await.unwrap();
    assert_eq!(removed.port, Some(9095));
    assert_eq!(removed.volumes, vec!["kafka-playground-kafka4-data"]);
    assert!(!pg
        .plane
        .get_cluster("default")
        .unwrap()
        .broker_names()
        .contains(&first.name));
    assert!(!pg.plane.store().read_raw().unwrap().contains("kafka4"));

    let again = pg.plane.add_broker("default").await.unwrap();
    assert_eq!(again.port, 9095);
    assert_eq!(again.name, "kafka4");
}

#[tokio::test]
async fn cluster_delete_cascades_to_brokers() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();

    let deleted = pg.plane.delete_cluster("beta").await.unwrap();
    assert_eq!(deleted.removed_brokers, vec!["kafka-beta-1", "kafka-beta-2"]);
    assert!(pg.runtime.status_of("kafka-beta-1").is_none());
    assert!(!pg.plane.store().read_raw().unwrap().contains("kafka-beta"));
    assert!(pg.plane.registry().get("beta").is_none());
}

#[tokio::test]
async fn failed_cascade_keeps_cluster_record() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();
    pg.runtime.fail_container("kafka-beta-2", "device busy");

    let err = pg.plane.delete_cluster("beta").await.unwrap_err();
    match err {
        ControlPlaneError::CascadeIncomplete { cluster, failed } => {
            assert_eq!(cluster, "beta");
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].broker, "kafka-beta-2");
            assert!(failed[0].error.contains("stop"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let beta = pg.plane.get_cluster("beta").unwrap();
    assert_eq!(beta.broker_names(), vec!["kafka-beta-2"]);

    pg.runtime.clear_failures();
    pg.plane.delete_cluster("beta").await.unwrap();
    assert!(pg.plane.get_cluster("beta").is_err());
}

#[tokio::test]
async fn topic_requests_are_checked_in_order() {
    let pg = playground().await;

    let err = pg.plane.create_topic("default", &topic("bad name", 0, 9)).await.unwrap_err();
    assert!(matches!(&err, ControlPlaneError::InvalidTopicSpec(reason) if reason.contains("name")));
    let err = pg.plane.create_topic("default", &topic("orders", 0, 9)).await.unwrap_err();
    assert!(matches!(&err, ControlPlaneError::InvalidTopicSpec(reason) if reason.contains("partitions")));
    let err = pg.plane.create_topic("default", &topic("orders", 3, 4)).await.unwrap_err();
    assert!(matches!(&err, ControlPlaneError::InvalidTopicSpec(reason) if reason.contains("replication")));

    pg.plane.create_topic("default", &topic("orders", 3, 3)).await.unwrap();
    assert!(matches!(
        pg.plane.create_topic("default", &topic("orders", 1, 1)).await,
        Err(ControlPlaneError::TopicAlreadyExists(_))
    ));
    let topics = pg.plane.list_topics("default").await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!((topics[0].name.as_str(), topics[0].partitions), ("orders", 3));

    assert!(matches!(
        pg.plane.delete_topic("default", "payments").await,
        Err(ControlPlaneError::TopicNotFound(_))
    ));
    pg.plane.delete_topic("default", "orders").await.unwrap();
    assert!(pg.plane.list_topics("default").await.unwrap().is_empty());
    assert!(matches!(
        pg.plane.list_topics("ghost").await,
        Err(ControlPlaneError::ClusterNotFound(_))
    ));
}

#[tokio::test]
async fn topics_need_a_running_broker() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    assert!(matches!(
        pg.plane.list_topics("beta").await,
        Err(ControlPlaneError::AdminUnreachable(_))
    ));
    let status = pg.plane.cluster_status("beta").await.unwrap();
    assert_eq!(status.topic_count, 0);
    assert_eq!(status.broker_count, 0);

    let stopped = pg.plane.stop_cluster(Some("default")).await.unwrap();
    assert_eq!(stopped, vec!["kafka1", "kafka2", "kafka3"]);
    assert!(matches!(
        pg.plane.create_topic("default", &topic("orders", 1, 1)).await,
        Err(ControlPlaneError::AdminUnreachable(_))
    ));
    assert!(pg.runtime.status_of("zookeeper").unwrap().is_running());

    pg.plane.start_cluster(Some("default")).await.unwrap();
    pg.plane.create_topic("default", &topic("orders", 1, 1)).await.unwrap();
}

#[tokio::test]
async fn stop_without_cluster_leaves_infrastructure_running() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();

    let stopped = pg.plane.stop_cluster(None).await.unwrap();
    assert_eq!(stopped, vec!["kafka-beta-1", "kafka1", "kafka2", "kafka3"]);
    for infra in ["zookeeper", "kafka-ui", "control-panel", "jupyter"] {
        assert!(pg.runtime.status_of(infra).unwrap().is_running(), "{infra}");
    }
}

#[tokio::test]
async fn empty_description_is_malformed_not_repaired() {
    let pg = playground().await;
    let path = pg.plane.store().path().to_path_buf();
    std::fs::write(&path, "").unwrap();

    assert!(matches!(
        pg.plane.list_clusters(),
        Err(ControlPlaneError::MalformedDescription(_))
    ));
    assert!(matches!(
        pg.plane.add_broker("default").await,
        Err(ControlPlaneError::MalformedDescription(_))
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

    pg.plane.reset().await.unwrap();
    let default = pg.plane.get_cluster("default").unwrap();
    assert_eq!(default.broker_names(), vec!["kafka1", "kafka2", "kafka3"]);
    assert!(pg.plane.store().read().unwrap().services.contains_key("zookeeper"));
}

#[tokio::test]
async fn malformed_description_halts_mutations_until_reset() {
    let pg = playground().await;
    let path = pg.plane.store().path().to_path_buf();
    let good = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, "services: [unterminated").unwrap();

    assert!(matches!(
        pg.plane.add_broker("default").await,
        Err(ControlPlaneError::MalformedDescription(_))
    ));
    std::fs::write(&path, &good).unwrap();
    assert!(matches!(
        pg.plane.delete_broker("kafka1").await,
        Err(ControlPlaneError::MalformedDescription(_))
    ));

    pg.plane.reset().await.unwrap();
    let added = pg.plane.add_broker("default").await.unwrap();
    assert_eq!(added.port, 9095);
}

#[tokio::test]
async fn new_broker_reports_provisioning_then_running() {
    let pg = playground_with(2, None);
    pg.plane.start_cluster(None).await.unwrap();
    let added = pg.plane.add_broker("default").await.unwrap();

    let first = pg.plane.broker_status(&added.name).await.unwrap();
    assert_eq!(first.state, BrokerState::Provisioning);
    assert_eq!(first.port, Some(9095));

    let mut state = first.state;
    for _ in 0..5 {
        let next = pg.plane.broker_status(&added.name).await.unwrap().state;
        assert!(next == state || state.can_transition_to(next));
        state = next;
        if state == BrokerState::Running {
            break;
        }
    }
    assert_eq!(state, BrokerState::Running);
    assert_eq!(
        pg.plane.broker_status("kafka99").await.unwrap().state,
        BrokerState::Gone
    );
}

#[tokio::test]
async fn brokers_stop_and_start() {
    let pg = playground().await;
    assert_eq!(pg.plane.stop_broker("kafka1").await.unwrap(), BrokerState::Stopped);
    assert_eq!(pg.plane.stop_broker("kafka1").await.unwrap(), BrokerState::Stopped);
    assert_eq!(pg.plane.start_broker("kafka1").await.unwrap(), BrokerState::Running);
    assert!(matches!(
        pg.plane.start_broker("kafka42").await,
        Err(ControlPlaneError::NotFound(_))
    ));
}

#[tokio::test]
async fn status_lists_infrastructure_and_cluster_brokers() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.add_broker("beta").await.unwrap();

    let status = pg.plane.cluster_status("default").await.unwrap();
    assert_eq!(status.broker_count, 3);
    assert_eq!(
        status.kafka_servers,
        "localhost:9092,localhost:9093,localhost:9094"
    );
    assert!(status.containers.contains_key("zookeeper"));
    assert!(!status.containers.contains_key("kafka-beta-1"));
    assert_eq!(status.containers["kafka2"].state, Some(BrokerState::Running));
    assert_eq!(status.containers["kafka2"].port, Some(9093));
}

#[tokio::test]
async fn validation_reports_shared_ports() {
    let pg = playground().await;
    let report = pg.plane.validate_config().await.unwrap();
    assert!(report.valid);
    assert_eq!(report.port_map[&9092], vec!["kafka1"]);

    let store = pg.plane.store();
    let mut description = store.read().unwrap();
    description.services["kafka-ui"].ports = vec![Value::String("9092:8080".to_owned())];
    store.write(&description).unwrap();

    let report = pg.plane.validate_config().await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.issues.len(), 1);
    assert!(report.issues[0].contains("9092"));
}

#[tokio::test]
async fn unavailable_runtime_surfaces_on_add() {
    let pg = playground().await;
    pg.runtime.set_unavailable(Some("daemon gone"));
    let err = pg.plane.add_broker("default").await.unwrap_err();
    assert!(matches!(err.root(), ControlPlaneError::RuntimeUnavailable(_)));
    pg.runtime.set_unavailable(None);
    assert!(pg
        .plane
        .get_cluster("default")
        .unwrap()
        .broker_names()
        .contains(&"kafka4".to_owned()));
}

#[tokio::test]
async fn metrics_follow_operations() {
    let registry = kpg_metrics::new_registry();
    let pg = playground_with(0, Some(registry.clone()));
    pg.plane.start_cluster(None).await.unwrap();
    pg.plane.add_broker("default").await.unwrap();
    let _ = pg.plane.add_broker("ghost").await;
    pg.plane.reset().await.unwrap();

    let (body, _) = kpg_metrics::render(&registry).unwrap();
    assert!(body.contains(r#"kpg_operations_total{operation="broker_add",outcome="success"} 1"#));
    assert!(body.contains(r#"kpg_operations_total{operation="broker_add",outcome="failure"} 1"#));
    assert!(body.contains("kpg_declared_brokers 3"));
    assert!(body.contains("kpg_resets_total 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_whole_descriptions_during_mutations() {
    let pg = playground().await;
    let writer = {
        let plane = pg.plane.clone();
        tokio::spawn(async move {
            for _ in 0..40 {
                let added = plane.add_broker("default").await?;
                plane.delete_broker(&added.name).await?;
            }
            Ok::<_, ControlPlaneError>(())
        })
    };

    loop {
        let default = pg.plane.get_cluster("default").unwrap();
        assert!(
            (3..=4).contains(&default.brokers.len()),
            "default had {} brokers",
            default.brokers.len()
        );
        pg.plane.list_topics("default").await.unwrap();
        assert_eq!(pg.plane.stop_broker("kafka1").await.unwrap(), BrokerState::Stopped);
        assert_eq!(pg.plane.start_broker("kafka1").await.unwrap(), BrokerState::Running);
        if writer.is_finished() {
            break;
        }
        tokio::task::yield_now().await;
    }
    writer.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_receive_unique_ports() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();
    pg.plane.create_cluster("gamma").await.unwrap();
    let before = pg.plane.store().read().unwrap().brokers().len();

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let plane = pg.plane.clone();
            let cluster = ["default", "beta", "gamma"][i % 3];
            tokio::spawn(async move { plane.add_broker(cluster).await })
        })
        .collect();

    let mut ports = BTreeSet::new();
    let mut names = BTreeSet::new();
    for task in tasks {
        let added = task.await.unwrap().unwrap();
        assert!(ports.insert(added.port), "port {} handed out twice", added.port);
        assert!(names.insert(added.name.clone()), "{} declared twice", added.name);
    }

    let description = pg.plane.store().read().unwrap();
    let brokers = description.brokers();
    assert_eq!(brokers.len(), before + 12);
    let declared: BTreeSet<u16> = brokers.iter().filter_map(|broker| broker.port).collect();
    assert_eq!(declared.len(), brokers.len());
    assert!(ports.is_subset(&declared));
    assert!(pg.plane.validate_config().await.unwrap().valid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reset_interleaves_cleanly_with_mutations() {
    let pg = playground().await;
    pg.plane.create_cluster("beta").await.unwrap();

    let mut tasks: Vec<_> = (0..8)
        .map(|round| {
            let plane = pg.plane.clone();
            let cluster = if round % 2 == 0 { "default" } else { "beta" };
            tokio::spawn(async move {
                let outcome = match plane.add_broker(cluster).await {
                    Ok(added) => plane.delete_broker(&added.name).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = outcome {
                    assert!(
                        matches!(
                            err.root(),
                            ControlPlaneError::ClusterNotFound(_) | ControlPlaneError::NotFound(_)
                        ),
                        "unexpected error: {err}"
                    );
                }
            })
        })
        .collect();
    let plane = pg.plane.clone();
    tasks.push(tokio::spawn(async move {
        plane.reset().await.unwrap();
    }));
    for task in tasks {
        task.await.unwrap();
    }

    pg.plane.reset().await.unwrap();
    let clusters = pg.plane.list_clusters().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].broker_names(), vec!["kafka1", "kafka2", "kafka3"]);
    let ports: Vec<_> = clusters[0].brokers.iter().map(|broker| broker.port).collect();
    assert_eq!(ports, vec![Some(9092), Some(9093), Some(9094)]);
    assert!(pg.plane.validate_config().await.unwrap().valid);
}
