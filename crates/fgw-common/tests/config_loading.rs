//! ---
//! fgw_section: "01-core-functionality"
//! fgw_subsection: "tests"
//! fgw_type: "source"
//! fgw_scope: "code"
//! fgw_description: "Configuration file loading across supported formats."
//! fgw_version: "v0.1.0"
//! fgw_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use fgw_common::config::DriverConfig;
use tempfile::tempdir;

#[test]
fn loads_yaml_with_runtime_overrides() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("driver.yaml");
    fs::write(
        &path,
        r#"
nodeName: standbyNode
storeConnectionString: "memory://"
storeDatabaseName: json_scada
runtime:
  queue_bound: 5000
  idle_sleep: 100
connections:
  - protocolDriver: SIMULATED
    protocolDriverInstanceNumber: 1
    protocolConnectionNumber: 7
    name: SIM7
"#,
    )
    .unwrap();

    let config = DriverConfig::from_path(&path).unwrap();
    assert_eq!(config.node_name, "standbyNode");
    assert_eq!(config.runtime.queue_bound, 5000);
    assert_eq!(config.runtime.idle_sleep, Duration::from_millis(100));
    assert_eq!(config.connections.len(), 1);
    assert!(!config.connections[0].auto_create_tags);
}

#[test]
fn loads_toml_from_candidate_list() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("missing.json");
    let path = dir.path().join("driver.toml");
    fs::write(
        &path,
        r#"
nodeName = "mainNode"
mongoConnectionString = "memory://"
mongoDatabaseName = "json_scada"

[metrics]
enabled = true
listen = "127.0.0.1:9901"
"#,
    )
    .unwrap();

    let loaded = DriverConfig::load_with_source(&[missing, path.clone()]).unwrap();
    assert_eq!(loaded.source, path);
    assert!(loaded.config.metrics.enabled);
    assert_eq!(loaded.config.metrics.listen.port(), 9901);
}

#[test]
fn parse_errors_report_the_field_path() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("driver.json");
    fs::write(
        &path,
        r#"{"nodeName":"a","mongoConnectionString":"memory://","mongoDatabaseName":"db","runtime":{"batch_size":"many"}}"#,
    )
    .unwrap();

    let err = DriverConfig::from_path(&path).unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("runtime.batch_size"), "{rendered}");
}

#[test]
fn missing_database_name_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("driver.json");
    fs::write(
        &path,
        r#"{"nodeName":"a","mongoConnectionString":"memory://","mongoDatabaseName":""}"#,
    )
    .unwrap();

    assert!(DriverConfig::from_path(&path).is_err());
}
