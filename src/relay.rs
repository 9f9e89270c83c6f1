//! Upstream relay
//!
//! Forwards printed film boxes to a real printer over a secondary
//! association and reports the printer's status. The link is opened lazily
//! by the first relayed print, kept for the life of the client association
//! and torn down in the background when the client goes away. Status
//! queries reuse the link when there is one and otherwise use a short-lived
//! association.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use dimse::types::uids;
use dimse::{DimseCommand, DimseError, DimseMessage, DimseScu, RemoteNode, ScuAssociation};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PrintError;
use crate::job::{element_str, reference_sequence, referenced_instances, PrintJob};
use crate::policy::UpstreamTolerance;

/// Result of forwarding a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Success,
    Failure(String),
}

/// Printer Status / Printer Status Info pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterStatus {
    pub status: String,
    pub info: String,
}

impl PrinterStatus {
    pub fn new(status: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            info: info.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new("NORMAL", "NORMAL")
    }
}

/// What the relay knows about the upstream printer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamStatus {
    NotConfigured,
    Reported(PrinterStatus),
    Unavailable(String),
}

/// Forwards print jobs to the upstream printer of one client association
#[async_trait]
pub trait UpstreamRelay: Send {
    /// Forward a printed film box
    async fn relay(&mut self, job: &PrintJob) -> RelayOutcome;

    /// Query the upstream printer status
    async fn printer_status(&mut self) -> UpstreamStatus;

    /// Tear down the upstream link without waiting for it
    async fn close(&mut self);
}

/// Client-visible result of a print given the upstream outcome
pub fn reconcile(tolerance: UpstreamTolerance, outcome: RelayOutcome) -> Result<(), PrintError> {
    match (outcome, tolerance) {
        (RelayOutcome::Success, _) => Ok(()),
        (RelayOutcome::Failure(detail), UpstreamTolerance::BestEffort) => {
            warn!("Ignoring upstream failure: {}", detail);
            Ok(())
        }
        (RelayOutcome::Failure(detail), UpstreamTolerance::Strict) => Err(PrintError::Upstream(detail)),
    }
}

/// Printer status reported to the client given what the upstream said
pub fn resolve_printer_status(tolerance: UpstreamTolerance, upstream: UpstreamStatus) -> PrinterStatus {
    match (upstream, tolerance) {
        (UpstreamStatus::NotConfigured, _) => PrinterStatus::normal(),
        (UpstreamStatus::Reported(status), _) => status,
        (UpstreamStatus::Unavailable(detail), UpstreamTolerance::BestEffort) => {
            debug!("Upstream status unavailable: {}", detail);
            PrinterStatus::new("WARNING", "PRINTER DOWN")
        }
        (UpstreamStatus::Unavailable(detail), UpstreamTolerance::Strict) => {
            debug!("Upstream status unavailable: {}", detail);
            PrinterStatus::new("FAILURE", "PRINTER DOWN")
        }
    }
}

/// Relay for printers without an upstream
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpstream;

#[async_trait]
impl UpstreamRelay for NoUpstream {
    async fn relay(&mut self, job: &PrintJob) -> RelayOutcome {
        debug!("No upstream printer for {}, film box {} printed locally", job.printer, job.film_box.instance_uid);
        RelayOutcome::Success
    }

    async fn printer_status(&mut self) -> UpstreamStatus {
        UpstreamStatus::NotConfigured
    }

    async fn close(&mut self) {}
}

/// Upper bound for a status query, including the wait for the printer lock
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-printer locks serializing upstream conversations
#[derive(Debug, Default)]
pub struct RelayLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RelayLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_printer(&self, printer: &str) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(printer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

struct UpstreamLink {
    association: ScuAssociation,
    session_uid: Option<String>,
    /// Presentation LUTs whose N-DELETE failed
    stale_luts: Vec<String>,
}

/// Relay over a DIMSE association to the upstream printer
pub struct DimseRelay {
    printer: String,
    node: RemoteNode,
    scu: DimseScu,
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    request_timeout: Duration,
    link: Option<UpstreamLink>,
    /// Set while a conversation on the link is in progress
    in_flight: bool,
}

impl DimseRelay {
    /// `request_timeout` bounds every DIMSE request on the link and is the
    /// connect timeout unless `node` sets its own
    pub fn new(
        printer: impl Into<String>,
        node: RemoteNode,
        locks: &RelayLocks,
        cancel: CancellationToken,
        max_pdu: u32,
        request_timeout: Duration,
    ) -> Self {
        let printer = printer.into();
        Self {
            lock: locks.for_printer(&printer),
            scu: DimseScu::new(printer.clone(), max_pdu, request_timeout),
            printer,
            node,
            cancel,
            request_timeout,
            link: None,
            in_flight: false,
        }
    }

    async fn link(&mut self) -> dimse::Result<&mut UpstreamLink> {
        if self.link.is_none() {
            let association = self
                .scu
                .connect(
                    &self.node,
                    &[uids::BASIC_GRAYSCALE_PRINT_META, uids::PRESENTATION_LUT],
                )
                .await?;
            if association.context_for(uids::BASIC_GRAYSCALE_PRINT_META).is_none() {
                association.abort().await;
                return Err(DimseError::NoPresentationContext(format!(
                    "{} does not support Basic Grayscale Print Management",
                    self.node.address()
                )));
            }
            self.link = Some(UpstreamLink {
                association,
                session_uid: None,
                stale_luts: Vec::new(),
            });
        }
        self.link
            .as_mut()
            .ok_or_else(|| DimseError::Closed("upstream link".into()))
    }

    async fn forward(&mut self, job: &PrintJob) -> dimse::Result<()> {
        let timeout = self.request_timeout;
        let link = self.link().await?;

        let session_uid = match &link.session_uid {
            Some(uid) => uid.clone(),
            None => {
                let rq = DimseMessage::request(DimseCommand::NCreateRq, 0, uids::BASIC_FILM_SESSION, None)
                    .with_dataset(job.session.attributes.clone());
                let rsp = exchange(&mut link.association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await?;
                let uid = created_uid(&rsp)?;
                link.session_uid = Some(uid.clone());
                uid
            }
        };

        let mut box_attributes = job.film_box.attributes.clone();
        box_attributes.remove_element(tags::REFERENCED_PRESENTATION_LUT_SEQUENCE);
        box_attributes.put(reference_sequence(
            tags::REFERENCED_FILM_SESSION_SEQUENCE,
            uids::BASIC_FILM_SESSION,
            &session_uid,
        ));

        let mut upstream_lut = None;
        if let Some(lut) = &job.presentation_lut {
            if link.association.context_for(uids::PRESENTATION_LUT).is_some() {
                let rq = DimseMessage::request(DimseCommand::NCreateRq, 0, uids::PRESENTATION_LUT, None)
                    .with_dataset(lut.attributes.clone());
                let rsp = exchange(&mut link.association, uids::PRESENTATION_LUT, rq, timeout).await?;
                let uid = created_uid(&rsp)?;
                box_attributes.put(reference_sequence(
                    tags::REFERENCED_PRESENTATION_LUT_SEQUENCE,
                    uids::PRESENTATION_LUT,
                    &uid,
                ));
                upstream_lut = Some(uid);
            } else {
                warn!("Upstream printer rejected Presentation LUT, forwarding without it");
            }
        }

        let rq = DimseMessage::request(DimseCommand::NCreateRq, 0, uids::BASIC_FILM_BOX, None)
            .with_dataset(box_attributes);
        let rsp = exchange(&mut link.association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await?;
        let box_uid = created_uid(&rsp)?;
        let image_box_uids = rsp
            .dataset
            .as_ref()
            .map(|ds| referenced_instances(ds, tags::REFERENCED_IMAGE_BOX_SEQUENCE))
            .unwrap_or_default();

        for image_box in job.populated_image_boxes() {
            let uid = image_box_uids
                .get(usize::from(image_box.position).saturating_sub(1))
                .ok_or_else(|| {
                    DimseError::operation_failed(format!(
                        "upstream film box has no image box at position {}",
                        image_box.position
                    ))
                })?;
            let rq = DimseMessage::request(
                DimseCommand::NSetRq,
                0,
                uids::BASIC_GRAYSCALE_IMAGE_BOX,
                Some(uid.clone()),
            )
            .with_dataset(image_box.to_dataset());
            exchange(&mut link.association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await?;
        }

        let rq = DimseMessage::request(DimseCommand::NActionRq, 0, uids::BASIC_FILM_BOX, Some(box_uid.clone()))
            .with_action_type(1);
        exchange(&mut link.association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await?;

        // the page is printed; leftovers only cost upstream memory
        let rq = DimseMessage::request(DimseCommand::NDeleteRq, 0, uids::BASIC_FILM_BOX, Some(box_uid));
        if let Err(e) = exchange(&mut link.association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await {
            warn!("Failed to delete upstream film box: {}", e);
        }
        if let Some(uid) = upstream_lut {
            let rq = DimseMessage::request(DimseCommand::NDeleteRq, 0, uids::PRESENTATION_LUT, Some(uid.clone()));
            if let Err(e) = exchange(&mut link.association, uids::PRESENTATION_LUT, rq, timeout).await {
                warn!("Failed to delete upstream Presentation LUT, retrying on release: {}", e);
                link.stale_luts.push(uid);
            }
        }
        Ok(())
    }

    async fn query_status(&mut self, timeout: Duration) -> dimse::Result<PrinterStatus> {
        if let Some(link) = self.link.as_mut() {
            return get_printer_status(&mut link.association, timeout).await;
        }

        debug!("Querying {} on a short-lived association", self.node.address());
        let mut association = self.scu.connect(&self.node, &[uids::BASIC_GRAYSCALE_PRINT_META]).await?;
        let result = get_printer_status(&mut association, timeout).await;
        if let Err(e) = association.release().await {
            debug!("Failed to release status association: {}", e);
        }
        result
    }

    /// Abort and forget the link after a failure
    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            tokio::spawn(async move {
                link.association.abort().await;
            });
        }
    }
}

#[async_trait]
impl UpstreamRelay for DimseRelay {
    async fn relay(&mut self, job: &PrintJob) -> RelayOutcome {
        let cancel = self.cancel.clone();
        let lock = self.lock.clone();
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return RelayOutcome::Failure("relay abandoned".into()),
            guard = lock.lock_owned() => guard,
        };

        info!(
            "Relaying film box {} ({} images) to {}",
            job.film_box.instance_uid,
            job.populated_image_boxes().count(),
            self.node.address()
        );
        self.in_flight = true;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DimseError::operation_failed("relay abandoned")),
            result = self.forward(job) => result,
        };
        self.in_flight = false;

        match result {
            Ok(()) => {
                info!("Upstream printer {} accepted film box {}", self.node.ae_title, job.film_box.instance_uid);
                RelayOutcome::Success
            }
            Err(e) => {
                warn!("Relay to {} failed: {}", self.node.address(), e);
                self.drop_link();
                RelayOutcome::Failure(e.to_string())
            }
        }
    }

    async fn printer_status(&mut self) -> UpstreamStatus {
        let cancel = self.cancel.clone();
        let lock = self.lock.clone();
        let limit = self.request_timeout.min(STATUS_TIMEOUT);

        let query = async {
            let _guard = lock.lock().await;
            self.in_flight = true;
            let result = self.query_status(limit).await;
            self.in_flight = false;
            result
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DimseError::operation_failed("relay abandoned")),
            result = tokio::time::timeout(limit, query) => result
                .unwrap_or_else(|_| Err(DimseError::Timeout("upstream printer status".into()))),
        };

        match result {
            Ok(status) => UpstreamStatus::Reported(status),
            Err(e) => {
                self.drop_link();
                UpstreamStatus::Unavailable(e.to_string())
            }
        }
    }

    async fn close(&mut self) {
        if self.in_flight {
            // a conversation was cut off midway; the link state is unknown
            debug!("Aborting upstream link of {} with a conversation in progress", self.printer);
            self.in_flight = false;
            self.drop_link();
            return;
        }
        let Some(link) = self.link.take() else {
            return;
        };
        let timeout = self.request_timeout;
        let printer = self.printer.clone();

        tokio::spawn(async move {
            let UpstreamLink {
                mut association,
                session_uid,
                stale_luts,
            } = link;
            let teardown = async move {
                for uid in stale_luts {
                    let rq = DimseMessage::request(DimseCommand::NDeleteRq, 0, uids::PRESENTATION_LUT, Some(uid));
                    if let Err(e) = exchange(&mut association, uids::PRESENTATION_LUT, rq, timeout).await {
                        debug!("Failed to delete upstream Presentation LUT: {}", e);
                    }
                }
                if let Some(uid) = session_uid {
                    let rq = DimseMessage::request(DimseCommand::NDeleteRq, 0, uids::BASIC_FILM_SESSION, Some(uid));
                    if let Err(e) = exchange(&mut association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await {
                        debug!("Failed to delete upstream film session: {}", e);
                    }
                }
                association.release().await
            };
            match tokio::time::timeout(timeout, teardown).await {
                Ok(Ok(())) => debug!("Released upstream link of {}", printer),
                Ok(Err(e)) => warn!("Failed to release upstream link of {}: {}", printer, e),
                Err(_) => warn!("Timed out releasing upstream link of {}", printer),
            }
        });
    }
}

/// Issue one request and require a success or warning status
async fn exchange(
    association: &mut ScuAssociation,
    abstract_syntax: &str,
    message: DimseMessage,
    timeout: Duration,
) -> dimse::Result<DimseMessage> {
    let command = message.command;
    let sop_class = message.sop_class_uid.clone();
    let rsp = tokio::time::timeout(timeout, association.request(abstract_syntax, message))
        .await
        .map_err(|_| DimseError::Timeout(format!("{} {}", command, sop_class)))??;

    match rsp.dimse_status() {
        Some(status) if status.is_ok() => Ok(rsp),
        _ => Err(DimseError::operation_failed(format!(
            "{} {} failed with status {:#06x}{}",
            command,
            sop_class,
            rsp.status.unwrap_or(0xFFFF),
            rsp.error_comment
                .as_deref()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        ))),
    }
}

/// N-GET of the Printer SOP instance
async fn get_printer_status(association: &mut ScuAssociation, timeout: Duration) -> dimse::Result<PrinterStatus> {
    let rq = DimseMessage::request(
        DimseCommand::NGetRq,
        0,
        uids::PRINTER,
        Some(uids::PRINTER_INSTANCE.to_string()),
    )
    .with_attribute_identifiers(vec![tags::PRINTER_STATUS, tags::PRINTER_STATUS_INFO]);
    let rsp = exchange(association, uids::BASIC_GRAYSCALE_PRINT_META, rq, timeout).await?;

    let dataset = rsp.dataset.unwrap_or_else(dicom_object::InMemDicomObject::new_empty);
    Ok(PrinterStatus::new(
        element_str(&dataset, tags::PRINTER_STATUS).unwrap_or_else(|| "NORMAL".into()),
        element_str(&dataset, tags::PRINTER_STATUS_INFO).unwrap_or_else(|| "NORMAL".into()),
    ))
}

fn created_uid(rsp: &DimseMessage) -> dimse::Result<String> {
    rsp.sop_instance_uid
        .clone()
        .ok_or_else(|| DimseError::operation_failed(format!("{} carries no SOP instance UID", rsp.command)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FilmBox, FilmSession, PresentationLut};
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_object::InMemDicomObject;
    use dimse::types::status;
    use dimse::{MessageExchange, Received, ScpAssociation, ScpOptions};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    type Seen = Vec<(DimseCommand, String)>;

    /// Upstream printer answering every request with `status_for`; resolves
    /// to the requests it saw once the link is released
    async fn scripted_upstream(status_for: fn(&DimseMessage) -> u16) -> (u16, JoinHandle<Seen>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let options = ScpOptions {
                ae_title: "REALPRINTER".into(),
                abstract_syntaxes: vec![uids::BASIC_GRAYSCALE_PRINT_META.into(), uids::PRESENTATION_LUT.into()],
                transfer_syntaxes: uids::UNCOMPRESSED_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()).collect(),
                max_pdu: 16384,
                strict: false,
                receive_timeout: None,
            };
            let mut association = ScpAssociation::accept(stream, &options).await.unwrap();
            let mut seen = Seen::new();
            while let Ok(Received::Message(rq)) = association.receive().await {
                seen.push((rq.command, rq.sop_class_uid.clone()));
                let mut rsp = rq.response(status_for(&rq));
                if rq.command == DimseCommand::NCreateRq {
                    rsp = rsp.with_instance(dimse::new_uid());
                }
                if rq.command == DimseCommand::NGetRq {
                    rsp = rsp.with_dataset(InMemDicomObject::from_element_iter([DataElement::new(
                        tags::PRINTER_STATUS,
                        VR::CS,
                        PrimitiveValue::from("NORMAL"),
                    )]));
                }
                association.send(rsp).await.unwrap();
            }
            seen
        });
        (port, handle)
    }

    fn job() -> PrintJob {
        let session = FilmSession::new("1.2.3", InMemDicomObject::new_empty());
        let film_box = FilmBox::new("1.2.3.4", &session, InMemDicomObject::new_empty(), None);
        PrintJob {
            printer: "PRINTSCP".into(),
            session,
            film_box,
            presentation_lut: None,
        }
    }

    #[test]
    fn test_reconcile() {
        assert_eq!(reconcile(UpstreamTolerance::Strict, RelayOutcome::Success), Ok(()));
        assert_eq!(
            reconcile(UpstreamTolerance::BestEffort, RelayOutcome::Failure("refused".into())),
            Ok(())
        );
        assert_eq!(
            reconcile(UpstreamTolerance::Strict, RelayOutcome::Failure("refused".into())),
            Err(PrintError::Upstream("refused".into()))
        );
    }

    #[test]
    fn test_resolve_printer_status() {
        assert_eq!(
            resolve_printer_status(UpstreamTolerance::Strict, UpstreamStatus::NotConfigured),
            PrinterStatus::normal()
        );
        assert_eq!(
            resolve_printer_status(
                UpstreamTolerance::Strict,
                UpstreamStatus::Reported(PrinterStatus::new("WARNING", "FILM LOW"))
            ),
            PrinterStatus::new("WARNING", "FILM LOW")
        );
        assert_eq!(
            resolve_printer_status(UpstreamTolerance::BestEffort, UpstreamStatus::Unavailable("x".into())).status,
            "WARNING"
        );
        assert_eq!(
            resolve_printer_status(UpstreamTolerance::Strict, UpstreamStatus::Unavailable("x".into())).status,
            "FAILURE"
        );
    }

    #[test]
    fn test_relay_locks_are_per_printer() {
        let locks = RelayLocks::new();
        let a = locks.for_printer("A");
        assert!(Arc::ptr_eq(&a, &locks.for_printer("A")));
        assert!(!Arc::ptr_eq(&a, &locks.for_printer("B")));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_fails() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let node = RemoteNode::new("REALPRINTER", "127.0.0.1", port);
        let mut relay = DimseRelay::new(
            "PRINTSCP",
            node,
            &RelayLocks::new(),
            CancellationToken::new(),
            16384,
            Duration::from_secs(2),
        );

        assert!(matches!(relay.relay(&job()).await, RelayOutcome::Failure(_)));
        assert!(matches!(relay.printer_status().await, UpstreamStatus::Unavailable(_)));
        relay.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_relay_is_abandoned() {
        let locks = RelayLocks::new();
        let cancel = CancellationToken::new();
        let node = RemoteNode::new("REALPRINTER", "127.0.0.1", 104);
        let mut relay = DimseRelay::new("PRINTSCP", node, &locks, cancel.clone(), 16384, Duration::from_secs(30));

        // another association holds the printer
        let held = locks.for_printer("PRINTSCP");
        let _guard = held.lock().await;
        cancel.cancel();

        assert_eq!(
            relay.relay(&job()).await,
            RelayOutcome::Failure("relay abandoned".into())
        );
    }

    #[test]
    fn test_request_timeout_is_not_the_connect_timeout() {
        let node = RemoteNode::new("REALPRINTER", "127.0.0.1", 104).with_timeout(500);
        let relay = DimseRelay::new(
            "PRINTSCP",
            node,
            &RelayLocks::new(),
            CancellationToken::new(),
            16384,
            Duration::from_secs(30),
        );
        assert_eq!(relay.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_status_query_does_not_keep_a_link() {
        let (port, upstream) = scripted_upstream(|_| status::SUCCESS).await;
        let node = RemoteNode::new("REALPRINTER", "127.0.0.1", port);
        let mut relay = DimseRelay::new(
            "PRINTSCP",
            node,
            &RelayLocks::new(),
            CancellationToken::new(),
            16384,
            Duration::from_secs(5),
        );

        assert_eq!(
            relay.printer_status().await,
            UpstreamStatus::Reported(PrinterStatus::normal())
        );
        assert!(relay.link.is_none());
        assert_eq!(upstream.await.unwrap(), vec![(DimseCommand::NGetRq, uids::PRINTER.to_string())]);
    }

    #[tokio::test]
    async fn test_status_query_does_not_wait_out_a_busy_printer() {
        let locks = RelayLocks::new();
        let node = RemoteNode::new("REALPRINTER", "127.0.0.1", 104);
        let mut relay = DimseRelay::new(
            "PRINTSCP",
            node,
            &locks,
            CancellationToken::new(),
            16384,
            Duration::from_millis(200),
        );

        let held = locks.for_printer("PRINTSCP");
        let _guard = held.lock().await;
        let status = tokio::time::timeout(Duration::from_secs(2), relay.printer_status())
            .await
            .unwrap();
        assert!(matches!(status, UpstreamStatus::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_undeleted_lut_is_deleted_on_release() {
        let (port, upstream) = scripted_upstream(|rq| {
            if rq.command == DimseCommand::NDeleteRq && rq.sop_class_uid == uids::PRESENTATION_LUT {
                status::PROCESSING_FAILURE
            } else {
                status::SUCCESS
            }
        })
        .await;
        let node = RemoteNode::new("REALPRINTER", "127.0.0.1", port);
        let mut relay = DimseRelay::new(
            "PRINTSCP",
            node,
            &RelayLocks::new(),
            CancellationToken::new(),
            16384,
            Duration::from_secs(5),
        );

        let mut job = job();
        job.presentation_lut = Some(PresentationLut {
            instance_uid: "1.2.3.9".into(),
            attributes: InMemDicomObject::new_empty(),
        });
        assert_eq!(relay.relay(&job).await, RelayOutcome::Success);
        relay.close().await;

        let seen = upstream.await.unwrap();
        let lut_deletes = seen
            .iter()
            .filter(|(command, class)| *command == DimseCommand::NDeleteRq && class == uids::PRESENTATION_LUT)
            .count();
        assert_eq!(lut_deletes, 2);
        assert_eq!(
            seen.last(),
            Some(&(DimseCommand::NDeleteRq, uids::BASIC_FILM_SESSION.to_string()))
        );
    }

    #[tokio::test]
    async fn test_no_upstream() {
        let mut relay = NoUpstream;
        assert_eq!(relay.relay(&job()).await, RelayOutcome::Success);
        assert_eq!(relay.printer_status().await, UpstreamStatus::NotConfigured);
    }
}
