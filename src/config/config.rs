use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use dimse::{BlockingMode, DimseConfig, DEFAULT_LISTEN_PORT, DEFAULT_TIMEOUT_SECS};
use serde::Deserialize;
use thiserror::Error;

use crate::config::{Cli, LoggingConfig};
use crate::enricher::resolve_tag;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("No printers configured")]
    NoPrinters,

    #[error("Invalid AE title '{0}': must be 1-16 characters without backslash")]
    InvalidAeTitle(String),

    #[error("Invalid port for printer '{0}'")]
    InvalidPort(String),

    #[error("Port {port} is used by more than one printer ('{printer}')")]
    DuplicatePort { printer: String, port: u16 },

    #[error("Invalid upstream for printer '{printer}': {reason}")]
    InvalidUpstream { printer: String, reason: String },

    #[error("Invalid tag rule '{tag}' for printer '{printer}': {reason}")]
    InvalidTagRule {
        printer: String,
        tag: String,
        reason: String,
    },

    #[error("Invalid server setting: {0}")]
    InvalidServer(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Printers keyed by the AE title they answer to
    #[serde(default)]
    pub printers: BTreeMap<String, PrinterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub blocking_mode: BlockingMode,
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,
    /// Strict PDU checking in the upper layer
    #[serde(default)]
    pub strict_pdu: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            blocking_mode: BlockingMode::default(),
            max_pdu: default_max_pdu(),
            strict_pdu: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PrinterConfig {
    pub port: Option<u16>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub ignore_upstream_errors: bool,
    #[serde(default)]
    pub strict_attributes: bool,
    pub upstream: Option<UpstreamConfig>,
    pub recognition: Option<RecognitionConfig>,
    #[serde(default)]
    pub tags: Vec<TagRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    /// Calling AE title presented upstream, defaults to the printer AE title
    pub calling_ae_title: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_language")]
    pub language: String,
    pub whitelist: Option<String>,
    pub page_segmentation: Option<u8>,
    /// Recognizer executable
    #[serde(default = "default_recognizer")]
    pub command: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            whitelist: None,
            page_segmentation: None,
            command: default_recognizer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRuleConfig {
    /// Keyword, `(gggg,eeee)` or `ggggeeee`
    pub tag: String,
    pub region: Option<RegionConfig>,
    pub strip_prefix: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RegionConfig {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Config {
    /// Load the configuration named on the command line
    pub fn from_args() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        Self::from_path(&cli.config)
    }

    /// Load and validate a configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.printers.is_empty() {
            return Err(ConfigError::NoPrinters);
        }
        if self.server.max_pdu < 16384 || self.server.max_pdu > 131072 {
            return Err(ConfigError::InvalidServer(
                "max_pdu must be between 16384 and 131072 bytes".into(),
            ));
        }
        if self.server.blocking_mode == BlockingMode::NonBlocking && self.server.timeout_secs == 0 {
            return Err(ConfigError::InvalidServer(
                "timeout_secs must be greater than 0 in nonblocking mode".into(),
            ));
        }

        let mut ports = HashSet::new();
        for (aet, printer) in &self.printers {
            if dimse::config::validate_ae_title(aet).is_err() {
                return Err(ConfigError::InvalidAeTitle(aet.clone()));
            }

            let port = self.port_for(printer);
            if port == 0 {
                return Err(ConfigError::InvalidPort(aet.clone()));
            }
            if !ports.insert(port) {
                return Err(ConfigError::DuplicatePort {
                    printer: aet.clone(),
                    port,
                });
            }

            if let Some(upstream) = &printer.upstream {
                upstream
                    .to_remote_node(aet)
                    .validate()
                    .map_err(|e| ConfigError::InvalidUpstream {
                        printer: aet.clone(),
                        reason: e.to_string(),
                    })?;
            }

            for rule in &printer.tags {
                rule.validate(aet)?;
            }
        }

        Ok(())
    }

    /// Listen port of a printer
    pub fn port_for(&self, printer: &PrinterConfig) -> u16 {
        printer.port.unwrap_or(self.server.port)
    }

    /// Acceptor settings for one printer
    pub fn dimse_config(&self, aet: &str, printer: &PrinterConfig) -> DimseConfig {
        let timeout_secs = printer.timeout_secs.unwrap_or(self.server.timeout_secs);
        DimseConfig {
            local_aet: aet.to_string(),
            bind_addr: self.server.bind_address,
            port: self.port_for(printer),
            max_pdu: self.server.max_pdu,
            connect_timeout_ms: timeout_secs * 1000,
            receive_timeout_ms: timeout_secs * 1000,
            blocking_mode: self.server.blocking_mode,
            strict: self.server.strict_pdu,
        }
    }
}

impl UpstreamConfig {
    pub fn to_remote_node(&self, printer_aet: &str) -> dimse::RemoteNode {
        let mut node = dimse::RemoteNode::new(self.ae_title.clone(), self.host.clone(), self.port)
            .with_calling_ae_title(
                self.calling_ae_title
                    .clone()
                    .unwrap_or_else(|| printer_aet.to_string()),
            );
        if let Some(secs) = self.timeout_secs {
            node = node.with_timeout(Duration::from_secs(secs).as_millis() as u64);
        }
        node
    }
}

impl TagRuleConfig {
    fn validate(&self, printer: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTagRule {
            printer: printer.to_string(),
            tag: self.tag.clone(),
            reason: reason.to_string(),
        };

        if resolve_tag(&self.tag).is_none() {
            return Err(invalid("unknown tag or not a text attribute"));
        }
        match (&self.value, &self.region) {
            (Some(_), Some(_)) => Err(invalid("value and region are mutually exclusive")),
            (None, None) => Err(invalid("either value or region is required")),
            (None, Some(region)) if region.width == 0 || region.height == 0 => {
                Err(invalid("region must have a non-zero size"))
            }
            _ => Ok(()),
        }
    }
}

// Default value functions
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_language() -> String {
    "eng".to_string()
}

fn default_recognizer() -> String {
    "tesseract".to_string()
}
