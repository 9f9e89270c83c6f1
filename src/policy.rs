//! Per-printer policy
//!
//! Each printer is identified by the AE title it answers to. Its policy
//! names the upstream printer (if any), how upstream failures are reported
//! to the client and which attributes are inserted at print time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dimse::{BlockingMode, RemoteNode, DEFAULT_LISTEN_PORT, DEFAULT_TIMEOUT_SECS};

use crate::config::{Config, ConfigError};
use crate::enricher::{RecognitionHint, TagRule};

/// How an upstream failure is reflected in the client-visible status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamTolerance {
    /// The print fails when the upstream printer fails
    #[default]
    Strict,
    /// The print succeeds locally whatever the upstream printer reports
    BestEffort,
}

impl UpstreamTolerance {
    pub fn from_ignore_errors(ignore_upstream_errors: bool) -> Self {
        if ignore_upstream_errors {
            UpstreamTolerance::BestEffort
        } else {
            UpstreamTolerance::Strict
        }
    }
}

/// Policy of one printer
#[derive(Debug, Clone)]
pub struct PrinterPolicy {
    pub ae_title: String,
    pub port: u16,
    pub receive_timeout: Option<Duration>,
    pub upstream: Option<RemoteNode>,
    pub tolerance: UpstreamTolerance,
    /// Reject attributes outside the print management modules
    pub strict_attributes: bool,
    pub tag_rules: Vec<TagRule>,
    pub hint: RecognitionHint,
    pub recognizer_command: String,
}

impl PrinterPolicy {
    /// Local-only printer with default settings
    pub fn new(ae_title: impl Into<String>) -> Self {
        Self {
            ae_title: ae_title.into(),
            port: DEFAULT_LISTEN_PORT,
            receive_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            upstream: None,
            tolerance: UpstreamTolerance::default(),
            strict_attributes: false,
            tag_rules: Vec::new(),
            hint: RecognitionHint::default(),
            recognizer_command: "tesseract".to_string(),
        }
    }

    pub fn with_upstream(mut self, upstream: RemoteNode) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_tolerance(mut self, tolerance: UpstreamTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_strict_attributes(mut self, strict: bool) -> Self {
        self.strict_attributes = strict;
        self
    }

    pub fn with_tag_rules(mut self, rules: Vec<TagRule>) -> Self {
        self.tag_rules = rules;
        self
    }

    fn from_config(config: &Config, aet: &str) -> Result<Self, ConfigError> {
        let printer = config
            .printers
            .get(aet)
            .ok_or_else(|| ConfigError::InvalidAeTitle(aet.to_string()))?;
        let dimse = config.dimse_config(aet, printer);

        let tag_rules = printer
            .tags
            .iter()
            .map(|rule| {
                TagRule::from_config(rule).ok_or_else(|| ConfigError::InvalidTagRule {
                    printer: aet.to_string(),
                    tag: rule.tag.clone(),
                    reason: "cannot be resolved".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let recognition = printer.recognition.clone().unwrap_or_default();

        Ok(Self {
            ae_title: aet.to_string(),
            port: dimse.port,
            receive_timeout: match config.server.blocking_mode {
                BlockingMode::Blocking => None,
                BlockingMode::NonBlocking => dimse.receive_timeout(),
            },
            upstream: printer.upstream.as_ref().map(|u| u.to_remote_node(aet)),
            tolerance: UpstreamTolerance::from_ignore_errors(printer.ignore_upstream_errors),
            strict_attributes: printer.strict_attributes,
            tag_rules,
            hint: RecognitionHint::from(&recognition),
            recognizer_command: recognition.command,
        })
    }
}

/// Read-only lookup of printer policies
pub trait PolicyStore: Send + Sync {
    /// Policy for the printer answering to `ae_title`
    fn lookup(&self, ae_title: &str) -> Option<Arc<PrinterPolicy>>;

    /// All configured printers
    fn printers(&self) -> Vec<Arc<PrinterPolicy>>;
}

/// Policy store backed by the configuration file
#[derive(Debug, Default)]
pub struct ConfigPolicyStore {
    printers: HashMap<String, Arc<PrinterPolicy>>,
}

impl ConfigPolicyStore {
    pub fn new(policies: impl IntoIterator<Item = PrinterPolicy>) -> Self {
        Self {
            printers: policies
                .into_iter()
                .map(|p| (p.ae_title.clone(), Arc::new(p)))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let policies = config
            .printers
            .keys()
            .map(|aet| PrinterPolicy::from_config(config, aet))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(policies))
    }
}

impl PolicyStore for ConfigPolicyStore {
    fn lookup(&self, ae_title: &str) -> Option<Arc<PrinterPolicy>> {
        self.printers.get(ae_title.trim()).cloned()
    }

    fn printers(&self) -> Vec<Arc<PrinterPolicy>> {
        let mut printers: Vec<_> = self.printers.values().cloned().collect();
        printers.sort_by(|a, b| a.ae_title.cmp(&b.ae_title));
        printers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    const CONFIG: &str = r#"
        [server]
        timeout_secs = 5

        [printers.PRINTSCP]
        ignore_upstream_errors = true

        [printers.PRINTSCP.upstream]
        ae_title = "REALPRINTER"
        host = "printer.local"
        port = 104

        [[printers.PRINTSCP.tags]]
        tag = "PatientID"
        region = { x = 0, y = 0, width = 100, height = 20 }

        [printers.STRICT]
        port = 10006
        strict_attributes = true
    "#;

    #[test]
    fn test_store_from_config() {
        let config = Config::parse(CONFIG).unwrap();
        let store = ConfigPolicyStore::from_config(&config).unwrap();

        let printer = store.lookup("PRINTSCP").unwrap();
        assert_eq!(printer.tolerance, UpstreamTolerance::BestEffort);
        assert_eq!(printer.receive_timeout, Some(Duration::from_secs(5)));
        assert_eq!(printer.tag_rules.len(), 1);
        assert_eq!(printer.tag_rules[0].tag, tags::PATIENT_ID);

        let upstream = printer.upstream.as_ref().unwrap();
        assert_eq!(upstream.ae_title, "REALPRINTER");
        assert_eq!(upstream.calling_ae_title.as_deref(), Some("PRINTSCP"));

        let strict = store.lookup("STRICT ").unwrap();
        assert_eq!(strict.tolerance, UpstreamTolerance::Strict);
        assert!(strict.strict_attributes);
        assert_eq!(strict.port, 10006);
        assert!(strict.upstream.is_none());

        assert!(store.lookup("UNKNOWN").is_none());
        assert_eq!(store.printers().len(), 2);
    }
}
