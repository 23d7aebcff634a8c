//! ---
//! kpg_section: "02-configuration-logging"
//! kpg_subsection: "integration-tests"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Configuration loading from candidate files."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::fs;
use std::path::PathBuf;

use kpg_common::config::{AppConfig, EndpointStyle, RuntimeMode};
use tempfile::tempdir;

#[test]
fn first_existing_candidate_wins() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("kpgd.toml");
    fs::write(
        &present,
        r#"
[runtime]
mode = "simulated"
compose_file = "/tmp/playground/docker-compose.yml"

[cluster]
base_port = 19092
endpoint_style = "internal"
reserved_ports = [19100]

[reset]
preserved_volumes = ["sandbox-notebooks", "sandbox-datasets"]
"#,
    )
    .unwrap();

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
    assert_eq!(loaded.source, Some(present));
    let config = loaded.config;
    assert_eq!(config.runtime.mode, RuntimeMode::Simulated);
    assert_eq!(config.cluster.base_port, 19092);
    assert_eq!(config.cluster.endpoint_style, EndpointStyle::Internal);
    assert_eq!(config.cluster.reserved_ports, vec![19100]);
    assert_eq!(config.reset.preserved_volumes.len(), 2);
}

#[test]
fn no_candidate_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let loaded = AppConfig::load_with_source(&[dir.path().join("absent.toml")]).unwrap();
    assert!(loaded.source.is_none());
    assert_eq!(loaded.config.cluster.base_port, 9092);
    assert_eq!(
        loaded.config.runtime.compose_file,
        PathBuf::from("/app/docker-compose.yml")
    );
}

#[test]
fn invalid_file_is_rejected_with_context() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[cluster]\nport_search_limit = 0\n").unwrap();
    let err = AppConfig::load(&[path]).unwrap_err();
    assert!(format!("{err:#}").contains("port_search_limit"));
}
