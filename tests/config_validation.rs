use std::io::Write;

use printscp::config::{Config, ConfigError};
use printscp::policy::{ConfigPolicyStore, PolicyStore, UpstreamTolerance};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_load_config_from_disk() {
    let file = write_config(
        r#"
        [server]
        port = 11112
        timeout_secs = 15

        [logging]
        level = "debug"
        log_to_file = true

        [printers.FRONTDESK]
        ignore_upstream_errors = true

        [printers.FRONTDESK.upstream]
        ae_title = "REALPRINTER"
        host = "10.0.0.5"
        port = 104
        timeout_secs = 5

        [[printers.FRONTDESK.tags]]
        tag = "(0010,0020)"
        region = { x = 0, y = 0, width = 300, height = 30 }
        strip_prefix = "ID:"

        [printers.RADIOLOGY]
        port = 11113
        strict_attributes = true

        [[printers.RADIOLOGY.tags]]
        tag = "00080080"
        value = "Central Hospital"
    "#,
    );

    let config = Config::from_path(file.path()).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.log_to_file);
    assert_eq!(config.logging.log_file_path, "printscp.log");

    let store = ConfigPolicyStore::from_config(&config).unwrap();
    let front = store.lookup("FRONTDESK").unwrap();
    assert_eq!(front.port, 11112);
    assert_eq!(front.tolerance, UpstreamTolerance::BestEffort);
    let upstream = front.upstream.as_ref().unwrap();
    assert_eq!(upstream.address(), "REALPRINTER@10.0.0.5:104");
    assert_eq!(upstream.connect_timeout_ms, Some(5000));

    let radiology = store.lookup("RADIOLOGY").unwrap();
    assert_eq!(radiology.port, 11113);
    assert!(radiology.strict_attributes);
    assert_eq!(radiology.tag_rules.len(), 1);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::from_path(dir.path().join("missing.toml"));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_malformed_file() {
    let file = write_config("[printers.PRINTSCP\nport = ");
    assert!(matches!(Config::from_path(file.path()), Err(ConfigError::Parse(_))));
}

#[test]
fn test_invalid_upstream() {
    let file = write_config(
        r#"
        [printers.PRINTSCP.upstream]
        ae_title = ""
        host = "10.0.0.5"
        port = 104
    "#,
    );
    match Config::from_path(file.path()) {
        Err(ConfigError::InvalidUpstream { printer, .. }) => assert_eq!(printer, "PRINTSCP"),
        other => panic!("Expected an invalid upstream, got {:?}", other),
    }
}

#[test]
fn test_invalid_pdu_size() {
    let file = write_config(
        r#"
        [server]
        max_pdu = 1024

        [printers.PRINTSCP]
    "#,
    );
    assert!(matches!(
        Config::from_path(file.path()),
        Err(ConfigError::InvalidServer(_))
    ));
}
