//! Service Class Provider (SCP) side of an association
//!
//! The A-ASSOCIATE-RQ is first peeked off the socket so the caller can
//! decide on it. Refusals are written directly as an A-ASSOCIATE-RJ PDU;
//! accepted requests are handed to `dicom-ul`, configured from the abstract
//! and transfer syntaxes the caller accepted.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dicom_ul::association::{Association, AsyncServerAssociation};
use dicom_ul::pdu::{AbortRQSource, PresentationContextResultReason};
use dicom_ul::Pdu;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::exchange::{MessageExchange, Received};
use crate::message::{DimseMessage, MessageAssembler};
use crate::{DimseError, Result};

/// PDU type of A-ASSOCIATE-RJ
const ASSOCIATE_RJ: u8 = 0x03;

/// Largest A-ASSOCIATE-RQ body drained before refusing
const MAX_DRAIN: u64 = 1 << 20;

/// Acceptor settings derived from the negotiation policy
#[derive(Debug, Clone)]
pub struct ScpOptions {
    /// Called AE title the acceptor answers to
    pub ae_title: String,
    /// Abstract syntaxes to accept
    pub abstract_syntaxes: Vec<String>,
    /// Transfer syntaxes to accept
    pub transfer_syntaxes: Vec<String>,
    /// Maximum PDU length
    pub max_pdu: u32,
    /// Strict PDU checking
    pub strict: bool,
    /// Receive timeout, `None` to block
    pub receive_timeout: Option<Duration>,
}

/// Reason carried by an A-ASSOCIATE-RJ issued by the service user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoReasonGiven,
    ApplicationContextNotSupported,
    CalledAeTitleNotRecognized,
}

impl RejectReason {
    fn code(self) -> u8 {
        match self {
            RejectReason::NoReasonGiven => 0x01,
            RejectReason::ApplicationContextNotSupported => 0x02,
            RejectReason::CalledAeTitleNotRecognized => 0x07,
        }
    }
}

/// Encode an A-ASSOCIATE-RJ PDU (DICOM PS3.8 section 9.3.4)
pub fn encode_associate_rj(transient: bool, reason: RejectReason) -> [u8; 10] {
    let result = if transient { 0x02 } else { 0x01 };
    // source 0x01: DICOM UL service-user
    [ASSOCIATE_RJ, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, result, 0x01, reason.code()]
}

/// Read and discard the pending A-ASSOCIATE-RQ, then refuse it
pub async fn reject_association(
    mut stream: TcpStream,
    transient: bool,
    reason: RejectReason,
    timeout: Duration,
) -> Result<()> {
    let drain = async {
        let mut header = [0u8; 6];
        stream.read_exact(&mut header).await?;
        let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as u64;
        let mut body = (&mut stream).take(length.min(MAX_DRAIN));
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        Ok::<_, std::io::Error>(header[0])
    };

    match tokio::time::timeout(timeout, drain).await {
        Ok(Ok(pdu_type)) => debug!("Refusing association request (PDU type {:#04x})", pdu_type),
        Ok(Err(e)) => debug!("Peer went away before refusal: {}", e),
        Err(_) => debug!("Timed out waiting for association request"),
    }

    stream.write_all(&encode_associate_rj(transient, reason)).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Presentation context proposed in an A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// The parts of an A-ASSOCIATE-RQ a negotiation policy looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRequest {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<RequestedContext>,
}

/// Read the pending A-ASSOCIATE-RQ without consuming it.
///
/// The request stays in the socket buffer, so the stream can still be
/// passed to [`ScpAssociation::accept`] or [`reject_association`].
pub async fn peek_association_request(stream: &TcpStream, timeout: Duration) -> Result<AssociationRequest> {
    let peek = async {
        let mut header = [0u8; 6];
        peek_exact(stream, &mut header).await?;
        if header[0] != 0x01 {
            return Err(DimseError::UnexpectedPdu(format!("PDU type {:#04x}", header[0])));
        }
        let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as u64;
        if length > MAX_DRAIN {
            return Err(DimseError::ul(format!("A-ASSOCIATE-RQ of {} bytes", length)));
        }

        let mut pdu = vec![0u8; header.len() + length as usize];
        peek_exact(stream, &mut pdu).await?;
        Ok(pdu)
    };
    let pdu = tokio::time::timeout(timeout, peek)
        .await
        .map_err(|_| DimseError::Timeout("waiting for A-ASSOCIATE-RQ".into()))??;

    match dicom_ul::read_pdu(&pdu[..], MAX_DRAIN as u32, false).map_err(|e| DimseError::ul(e.to_string()))? {
        Some(Pdu::AssociationRQ(rq)) => Ok(AssociationRequest {
            calling_ae_title: rq.calling_ae_title.trim().to_string(),
            called_ae_title: rq.called_ae_title.trim().to_string(),
            application_context_name: rq.application_context_name.trim_end_matches('\0').to_string(),
            presentation_contexts: rq
                .presentation_contexts
                .into_iter()
                .map(|pc| RequestedContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.trim_end_matches('\0').to_string(),
                    transfer_syntaxes: pc
                        .transfer_syntaxes
                        .iter()
                        .map(|ts| ts.trim_end_matches('\0').to_string())
                        .collect(),
                })
                .collect(),
        }),
        Some(other) => Err(DimseError::UnexpectedPdu(other.short_description().to_string())),
        None => Err(DimseError::Closed("incomplete A-ASSOCIATE-RQ".into())),
    }
}

/// Wait until `buf.len()` bytes can be peeked
async fn peek_exact(stream: &TcpStream, buf: &mut [u8]) -> Result<()> {
    loop {
        let n = stream.peek(buf).await?;
        if n == buf.len() {
            return Ok(());
        }
        if n == 0 {
            return Err(DimseError::Closed("peer closed before A-ASSOCIATE-RQ".into()));
        }
        // partial PDU in the socket buffer; peek returns at once until more arrives
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A presentation context accepted during negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// Established inbound association
pub struct ScpAssociation {
    association: AsyncServerAssociation<TcpStream>,
    assembler: MessageAssembler,
    ready: VecDeque<DimseMessage>,
    contexts: Vec<AcceptedContext>,
    receive_timeout: Option<Duration>,
}

impl ScpAssociation {
    /// Run association negotiation on an incoming connection
    pub async fn accept(stream: TcpStream, options: &ScpOptions) -> Result<Self> {
        let mut ul_options = dicom_ul::association::ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title(options.ae_title.as_str())
            .strict(options.strict)
            .max_pdu_length(options.max_pdu);

        for uid in &options.abstract_syntaxes {
            ul_options = ul_options.with_abstract_syntax(uid.as_str());
        }
        for uid in &options.transfer_syntaxes {
            ul_options = ul_options.with_transfer_syntax(uid.as_str());
        }

        let association = ul_options
            .establish_async(stream)
            .await
            .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

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

        info!(
            "New association from {} ({} accepted presentation contexts)",
            association.peer_ae_title(),
            contexts.len()
        );

        Ok(Self {
            association,
            assembler: MessageAssembler::new(),
            ready: VecDeque::new(),
            contexts,
            receive_timeout: options.receive_timeout,
        })
    }

    /// Calling AE title of the peer
    pub fn calling_ae_title(&self) -> &str {
        self.association.peer_ae_title()
    }

    /// Presentation contexts accepted for this association
    pub fn accepted_contexts(&self) -> &[AcceptedContext] {
        &self.contexts
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

    fn max_fragment(&self) -> usize {
        match self.association.requestor_max_pdu_length() {
            0 => usize::MAX,
            n => n.saturating_sub(100) as usize,
        }
    }
}

#[async_trait]
impl MessageExchange for ScpAssociation {
    async fn receive(&mut self) -> Result<Received> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(Received::Message(message));
            }

            // never time out in the middle of a fragmented message
            let timeout = if self.assembler.is_partial() {
                None
            } else {
                self.receive_timeout
            };
            let pdu = match timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, self.association.receive()).await {
                        Ok(pdu) => pdu,
                        Err(_) => return Ok(Received::Idle),
                    }
                }
                None => self.association.receive().await,
            }
            .map_err(|e| DimseError::ul(e.to_string()))?;

            debug!("scu ----> scp: {}", pdu.short_description());
            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        if let Some(assembled) = self.assembler.push(value)? {
                            let pc_id = assembled.message.presentation_context_id;
                            let ts = self.transfer_syntax_for(pc_id)?;
                            self.ready.push_back(assembled.into_message(&ts)?);
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    self.association.send(&Pdu::ReleaseRP).await.unwrap_or_else(|e| {
                        warn!("Failed to send association release message to SCU: {}", e);
                    });
                    info!("Released association with {}", self.association.peer_ae_title());
                    return Ok(Received::Released);
                }
                Pdu::AbortRQ { source } => {
                    warn!("Aborted connection from: {:?}", source);
                    return Ok(Received::Aborted);
                }
                other => {
                    return Err(DimseError::UnexpectedPdu(other.short_description().to_string()));
                }
            }
        }
    }

    async fn send(&mut self, message: DimseMessage) -> Result<()> {
        let ts = self.transfer_syntax_for(message.presentation_context_id)?;
        let max_fragment = self.max_fragment();
        let values = message.to_pdata_values(&ts, max_fragment)?;
        let total: usize = values.iter().map(|v| v.data.len()).sum();

        debug!("scu <---- scp: {} ({} bytes)", message.command, total);
        if total < max_fragment {
            self.association
                .send(&Pdu::PData { data: values })
                .await
                .map_err(|e| DimseError::ul(e.to_string()))?;
        } else {
            for value in values {
                self.association
                    .send(&Pdu::PData { data: vec![value] })
                    .await
                    .map_err(|e| DimseError::ul(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn abort(&mut self) {
        let abort = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        if let Err(e) = self.association.send(&abort).await {
            debug!("Failed to send A-ABORT: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_encode_associate_rj() {
        let pdu = encode_associate_rj(false, RejectReason::ApplicationContextNotSupported);
        assert_eq!(pdu, [0x03, 0, 0, 0, 0, 4, 0, 0x01, 0x01, 0x02]);

        let pdu = encode_associate_rj(true, RejectReason::NoReasonGiven);
        assert_eq!(pdu[7], 0x02);
        assert_eq!(pdu[9], 0x01);
    }

    #[tokio::test]
    async fn test_reject_association_drains_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // fake A-ASSOCIATE-RQ: type 0x01, body of 4 bytes
            stream.write_all(&[0x01, 0, 0, 0, 0, 4, 1, 2, 3, 4]).await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (stream, _) = listener.accept().await.unwrap();
        reject_association(stream, true, RejectReason::NoReasonGiven, Duration::from_secs(1))
            .await
            .unwrap();

        let reply = client.await.unwrap();
        assert_eq!(reply, encode_associate_rj(true, RejectReason::NoReasonGiven).to_vec());
    }

    #[tokio::test]
    async fn test_peeked_request_is_left_in_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let rq = Pdu::AssociationRQ(dicom_ul::pdu::AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "MODALITY".into(),
            called_ae_title: "PRINTSCP".into(),
            application_context_name: "1.2.3.4".into(),
            presentation_contexts: vec![dicom_ul::pdu::PresentationContextProposed {
                id: 1,
                abstract_syntax: crate::types::uids::BASIC_GRAYSCALE_PRINT_META.into(),
                transfer_syntaxes: vec![crate::types::uids::IMPLICIT_VR_LE.into()],
            }],
            user_variables: vec![],
        });
        let mut bytes = Vec::new();
        dicom_ul::write_pdu(&mut bytes, &rq).unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&bytes).await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (stream, _) = listener.accept().await.unwrap();
        let request = peek_association_request(&stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(request.calling_ae_title, "MODALITY");
        assert_eq!(request.called_ae_title, "PRINTSCP");
        assert_eq!(request.application_context_name, "1.2.3.4");
        assert_eq!(request.presentation_contexts.len(), 1);
        assert_eq!(request.presentation_contexts[0].id, 1);

        reject_association(
            stream,
            false,
            RejectReason::ApplicationContextNotSupported,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let reply = client.await.unwrap();
        assert_eq!(
            reply,
            encode_associate_rj(false, RejectReason::ApplicationContextNotSupported).to_vec()
        );
    }
}
