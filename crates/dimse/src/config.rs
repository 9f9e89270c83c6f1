//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::{DEFAULT_LISTEN_PORT, DEFAULT_TIMEOUT_SECS};

/// How the message exchange waits for the next inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingMode {
    /// Wait indefinitely
    Blocking,
    /// Wait up to the receive timeout, then report the exchange as idle
    #[default]
    NonBlocking,
}

/// Configuration for one DIMSE acceptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Receive timeout in milliseconds
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,

    /// Blocking mode for receive
    #[serde(default)]
    pub blocking_mode: BlockingMode,

    /// Reject presentation contexts and PDUs that deviate from the standard
    #[serde(default)]
    pub strict: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Calling AE title to present (defaults to the local AE title)
    pub calling_ae_title: Option<String>,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "PRINTSCP".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            receive_timeout_ms: default_receive_timeout(),
            blocking_mode: BlockingMode::default(),
            strict: false,
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Receive timeout, or `None` when receiving blocks indefinitely
    pub fn receive_timeout(&self) -> Option<Duration> {
        match self.blocking_mode {
            BlockingMode::Blocking => None,
            BlockingMode::NonBlocking => Some(Duration::from_millis(self.receive_timeout_ms)),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet)?;

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Port must be greater than 0",
            ));
        }

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.blocking_mode == BlockingMode::NonBlocking && self.receive_timeout_ms == 0 {
            return Err(crate::error::DimseError::config(
                "Receive timeout must be greater than 0 in non-blocking mode",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            calling_ae_title: None,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Set the calling AE title presented to this node
    pub fn with_calling_ae_title(mut self, aet: impl Into<String>) -> Self {
        self.calling_ae_title = Some(aet.into());
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Address in the `AE@host:port` form understood by the UL layer
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.ae_title, self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title)?;
        if let Some(calling) = &self.calling_ae_title {
            validate_ae_title(calling)?;
        }

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config(
                "Remote host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// AE titles are 1-16 characters of the default repertoire, no backslash
pub fn validate_ae_title(aet: &str) -> crate::error::Result<()> {
    let trimmed = aet.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-16 characters",
            aet
        )));
    }
    if trimmed.chars().any(|c| c == '\\' || c.is_control() || !c.is_ascii()) {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "'{}' contains invalid characters",
            aet
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_receive_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.local_aet, "PRINTSCP");
        assert_eq!(config.port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.receive_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_blocking_mode_has_no_timeout() {
        let config = DimseConfig {
            blocking_mode: BlockingMode::Blocking,
            ..Default::default()
        };
        assert_eq!(config.receive_timeout(), None);
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("REALPRINTER", "localhost", 104)
            .with_calling_ae_title("PRINTSCP")
            .with_timeout(10_000);

        assert_eq!(node.ae_title, "REALPRINTER");
        assert_eq!(node.address(), "REALPRINTER@localhost:104");
        assert_eq!(node.calling_ae_title.as_deref(), Some("PRINTSCP"));
        assert_eq!(node.connect_timeout_ms, Some(10_000));
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();
        assert!(config.validate().is_ok());

        config.local_aet = "".to_string();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());

        config.local_aet = "BAD\\AET".to_string();
        assert!(config.validate().is_err());
    }
}
