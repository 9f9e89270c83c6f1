//! Service Class User (SCU) side of an association
//!
//! Used by the upstream relay to drive a real printer. One association
//! carries a whole print job; requests are issued one at a time and the
//! matching response is awaited before the next request goes out.

use std::time::Duration;

use dicom_ul::association::AsyncClientAssociation;
use dicom_ul::pdu::{AbortRQSource, PresentationContextResultReason};
use dicom_ul::{ClientAssociationOptions, Pdu};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::RemoteNode;
use crate::message::{DimseMessage, MessageAssembler};
use crate::scp::AcceptedContext;
use crate::types::{status, uids, DimseCommand};
use crate::{DimseError, Result};

/// Factory for outbound associations
#[derive(Debug, Clone)]
pub struct DimseScu {
    calling_ae_title: String,
    max_pdu: u32,
    connect_timeout: Duration,
}

/// Established outbound association
pub struct ScuAssociation {
    association: AsyncClientAssociation<TcpStream>,
    contexts: Vec<AcceptedContext>,
    assembler: MessageAssembler,
    next_message_id: u16,
    peer: String,
}

impl DimseScu {
    /// Create a new SCU presenting the given calling AE title
    pub fn new(calling_ae_title: impl Into<String>, max_pdu: u32, connect_timeout: Duration) -> Self {
        Self {
            calling_ae_title: calling_ae_title.into(),
            max_pdu,
            connect_timeout,
        }
    }

    /// Open an association proposing each abstract syntax with all
    /// uncompressed transfer syntaxes
    pub async fn connect(&self, node: &RemoteNode, abstract_syntaxes: &[&str]) -> Result<ScuAssociation> {
        node.validate()?;

        let calling = node
            .calling_ae_title
            .clone()
            .unwrap_or_else(|| self.calling_ae_title.clone());
        let timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.connect_timeout);

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(calling)
            .called_ae_title(node.ae_title.clone())
            .max_pdu_length(node.max_pdu.unwrap_or(self.max_pdu));
        for abstract_syntax in abstract_syntaxes {
            options = options.with_presentation_context(
                *abstract_syntax,
                uids::UNCOMPRESSED_TRANSFER_SYNTAXES.to_vec(),
            );
        }

        let addr = format!("{}:{}", node.host, node.port);
        info!("Connecting to upstream printer {}", node.address());

        let association = tokio::time::timeout(timeout, options.establish_with_async(&addr))
            .await
            .map_err(|_| DimseError::Timeout(format!("connecting to {}", node.address())))?
            .map_err(|e| DimseError::AssociationRejected(format!("{}: {}", node.address(), e)))?;

        let contexts: Vec<AcceptedContext> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .map(|pc| AcceptedContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.trim_end_matches('\0').to_string(),
                transfer_syntax: pc.transfer_syntax.trim_end_matches('\0').to_string(),
            })
            .collect();

        if contexts.is_empty() {
            let _ = association.abort().await;
            return Err(DimseError::NoPresentationContext(format!(
                "{} accepted none of the proposed SOP classes",
                node.address()
            )));
        }

        debug!("Upstream association accepted {} presentation contexts", contexts.len());
        Ok(ScuAssociation {
            association,
            contexts,
            assembler: MessageAssembler::new(),
            next_message_id: 1,
            peer: node.address(),
        })
    }
}

impl ScuAssociation {
    /// Accepted context for an abstract syntax
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&AcceptedContext> {
        self.contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
    }

    /// Send a request on the context of `abstract_syntax` and wait for its
    /// response. Message ID and presentation context are assigned here.
    pub async fn request(&mut self, abstract_syntax: &str, mut message: DimseMessage) -> Result<DimseMessage> {
        let context = self
            .context_for(abstract_syntax)
            .cloned()
            .ok_or_else(|| DimseError::NoPresentationContext(abstract_syntax.to_string()))?;

        message.message_id = self.next_message_id;
        message.presentation_context_id = context.id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);

        self.send(&message, &context.transfer_syntax).await?;
        debug!("scu ----> {}: {} ({})", self.peer, message.command, message.sop_class_uid);

        loop {
            let incoming = self.receive().await?;
            if incoming.command == DimseCommand::NEventReportRq {
                // printer status events may interleave with our responses
                let ack = incoming.response(status::SUCCESS);
                let ts = self.transfer_syntax_for(ack.presentation_context_id)?;
                self.send(&ack, &ts).await?;
                continue;
            }
            if incoming.command != message.command.response() || incoming.message_id != message.message_id {
                return Err(DimseError::operation_failed(format!(
                    "expected {} for message {}, got {} for message {}",
                    message.command.response(),
                    message.message_id,
                    incoming.command,
                    incoming.message_id
                )));
            }
            debug!(
                "scu <---- {}: {} status {:#06x}",
                self.peer,
                incoming.command,
                incoming.status.unwrap_or_default()
            );
            return Ok(incoming);
        }
    }

    /// Gracefully release the association
    pub async fn release(self) -> Result<()> {
        self.association
            .release()
            .await
            .map_err(|e| DimseError::ul(e.to_string()))
    }

    /// Abort the association
    pub async fn abort(self) {
        if let Err(e) = self.association.abort().await {
            warn!("Failed to abort upstream association: {}", e);
        }
    }

    fn transfer_syntax_for(&self, presentation_context_id: u8) -> Result<String> {
        self.contexts
            .iter()
            .find(|pc| pc.id == presentation_context_id)
            .map(|pc| pc.transfer_syntax.clone())
            .ok_or_else(|| {
                DimseError::NoPresentationContext(format!("context id {}", presentation_context_id))
            })
    }

    async fn send(&mut self, message: &DimseMessage, transfer_syntax: &str) -> Result<()> {
        let max_fragment = match self.association.acceptor_max_pdu_length() {
            0 => usize::MAX,
            n => n.saturating_sub(100) as usize,
        };
        for value in message.to_pdata_values(transfer_syntax, max_fragment)? {
            self.association
                .send(&Pdu::PData { data: vec![value] })
                .await
                .map_err(|e| DimseError::ul(e.to_string()))?;
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<DimseMessage> {
        loop {
            let pdu = self
                .association
                .receive()
                .await
                .map_err(|e| DimseError::ul(e.to_string()))?;
            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        if let Some(assembled) = self.assembler.push(value)? {
                            let ts = self.transfer_syntax_for(assembled.message.presentation_context_id)?;
                            return assembled.into_message(&ts);
                        }
                    }
                }
                Pdu::AbortRQ { .. } => return Err(DimseError::Aborted),
                Pdu::ReleaseRQ => {
                    let _ = self.association.send(&Pdu::ReleaseRP).await;
                    return Err(DimseError::Closed(format!("{} released the association", self.peer)));
                }
                other => {
                    let _ = self
                        .association
                        .send(&Pdu::AbortRQ {
                            source: AbortRQSource::ServiceUser,
                        })
                        .await;
                    return Err(DimseError::UnexpectedPdu(other.short_description().to_string()));
                }
            }
        }
    }
}
