//! DIMSE (DICOM Message Service Element) plumbing for print management
//!
//! This crate provides the message layer shared by the print SCP and the
//! upstream relay: DIMSE-N and C-ECHO messages, their command set codec,
//! a message exchange abstraction over an established association, and
//! the acceptor (SCP) and requestor (SCU) sides of the association.
//!
//! # Features
//! - Inbound association handling (SCP) over `dicom-ul`
//! - Outbound association to an upstream printer (SCU)
//! - In-memory message exchange for embedding and testing

pub mod config;
pub mod error;
pub mod exchange;
pub mod message;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{BlockingMode, DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use exchange::{InMemoryExchange, MessageExchange, PeerEnd, PeerEvent, Received};
pub use message::DimseMessage;
pub use scp::{ScpAssociation, ScpOptions};
pub use scu::{DimseScu, ScuAssociation};
pub use types::{DimseCommand, DimseStatus};

/// Default listen port of the print SCP
pub const DEFAULT_LISTEN_PORT: u16 = 10005;

/// Default receive timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Generate a new UID under the UUID-derived `2.25` root
pub fn new_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}
