#![cfg(test)]

use std::time::Duration;

use dimse::BlockingMode;

use crate::config::config::{Config, ConfigError};

/// Parse a TOML string into a `Config` and run the project's validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    Config::parse(toml_str)
}

#[test]
fn test_basic_config() {
    let toml = r#"
        [server]
        bind_address = "127.0.0.1"
        timeout_secs = 10
        blocking_mode = "blocking"

        [logging]
        level = "debug"

        [printers.PRINTSCP]
        ignore_upstream_errors = true

        [printers.PRINTSCP.upstream]
        ae_title = "REALPRINTER"
        host = "10.0.0.5"
        port = 104

        [printers.PRINTSCP.recognition]
        language = "deu"
        page_segmentation = 7

        [[printers.PRINTSCP.tags]]
        tag = "PatientName"
        region = { x = 10, y = 10, width = 400, height = 40 }
        strip_prefix = "NAME:"

        [[printers.PRINTSCP.tags]]
        tag = "(0008,0080)"
        value = "Central Hospital"

        [printers.LOCALONLY]
        port = 10006
        strict_attributes = true
    "#;

    let result = load_config_from_str(toml);
    assert!(result.is_ok(), "Configuration should parse and validate: {:?}", result.err());

    let config = result.unwrap();

    // Server fields
    assert_eq!(config.server.port, 10005);
    assert_eq!(config.server.blocking_mode, BlockingMode::Blocking);
    assert_eq!(config.logging.level, "debug");
    assert!(!config.logging.log_to_file);

    // Printer fields
    let printer = &config.printers["PRINTSCP"];
    assert!(printer.ignore_upstream_errors);
    assert_eq!(printer.tags.len(), 2);
    assert_eq!(printer.recognition.as_ref().map(|r| r.language.as_str()), Some("deu"));
    assert_eq!(config.port_for(&config.printers["LOCALONLY"]), 10006);

    let dimse = config.dimse_config("PRINTSCP", printer);
    assert_eq!(dimse.local_aet, "PRINTSCP");
    assert_eq!(dimse.receive_timeout(), None);
    assert_eq!(dimse.connect_timeout(), Duration::from_secs(10));
}

#[test]
fn test_no_printers_is_rejected() {
    let result = load_config_from_str("[server]\nport = 10005\n");
    assert!(matches!(result, Err(ConfigError::NoPrinters)));
}

#[test]
fn test_duplicate_ports_are_rejected() {
    let toml = r#"
        [printers.FIRST]
        [printers.SECOND]
    "#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::DuplicatePort { port: 10005, .. })
    ));
}

#[test]
fn test_tag_rule_needs_exactly_one_source() {
    let both = r#"
        [printers.PRINTSCP]
        [[printers.PRINTSCP.tags]]
        tag = "PatientID"
        value = "123"
        region = { x = 0, y = 0, width = 10, height = 10 }
    "#;
    assert!(matches!(
        load_config_from_str(both),
        Err(ConfigError::InvalidTagRule { .. })
    ));

    let neither = r#"
        [printers.PRINTSCP]
        [[printers.PRINTSCP.tags]]
        tag = "PatientID"
    "#;
    assert!(matches!(
        load_config_from_str(neither),
        Err(ConfigError::InvalidTagRule { .. })
    ));
}

#[test]
fn test_unknown_tag_and_empty_region_are_rejected() {
    let unknown = r#"
        [printers.PRINTSCP]
        [[printers.PRINTSCP.tags]]
        tag = "NotAKeyword"
        value = "x"
    "#;
    assert!(load_config_from_str(unknown).is_err());

    let empty = r#"
        [printers.PRINTSCP]
        [[printers.PRINTSCP.tags]]
        tag = "PatientID"
        region = { x = 5, y = 5, width = 0, height = 10 }
    "#;
    assert!(load_config_from_str(empty).is_err());
}

#[test]
fn test_invalid_printer_ae_title() {
    let toml = r#"
        [printers.THIS_AE_TITLE_IS_TOO_LONG]
    "#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidAeTitle(_))
    ));
}
