//! Print job state machine
//!
//! One [`PrintScp`] serves one client association. It owns the job state,
//! the Presentation LUTs the client created and the upstream relay of the
//! printer, and answers every request with exactly one response. Errors
//! become response statuses; only transport failures end the association.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dicom_core::header::Header;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::types::{status, uids};
use dimse::{DimseCommand, DimseMessage, MessageExchange, Received};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::enricher::{apply_insertions, TagEnricher};
use crate::error::{PrintError, Result};
use crate::job::{referenced_instances, FilmBox, FilmSession, JobState, PresentationLut, PrintJob};
use crate::policy::PrinterPolicy;
use crate::relay::{self, UpstreamRelay};

/// Attributes of the Basic Film Session Presentation Module
const SESSION_ATTRIBUTES: &[Tag] = &[
    Tag(0x2000, 0x0010), // Number of Copies
    Tag(0x2000, 0x0020), // Print Priority
    Tag(0x2000, 0x0030), // Medium Type
    Tag(0x2000, 0x0040), // Film Destination
    Tag(0x2000, 0x0050), // Film Session Label
    Tag(0x2000, 0x0060), // Memory Allocation
    Tag(0x2100, 0x0160), // Owner ID
];

/// Attributes of the Basic Film Box Presentation and Relationship Modules
const FILM_BOX_ATTRIBUTES: &[Tag] = &[
    Tag(0x2010, 0x0010), // Image Display Format
    Tag(0x2010, 0x0030), // Annotation Display Format ID
    Tag(0x2010, 0x0040), // Film Orientation
    Tag(0x2010, 0x0050), // Film Size ID
    Tag(0x2010, 0x0060), // Magnification Type
    Tag(0x2010, 0x0080), // Smoothing Type
    Tag(0x2010, 0x0100), // Border Density
    Tag(0x2010, 0x0110), // Empty Image Density
    Tag(0x2010, 0x0120), // Min Density
    Tag(0x2010, 0x0130), // Max Density
    Tag(0x2010, 0x0140), // Trim
    Tag(0x2010, 0x0150), // Configuration Information
    Tag(0x2010, 0x015E), // Illumination
    Tag(0x2010, 0x0160), // Reflected Ambient Light
    Tag(0x2020, 0x0050), // Requested Resolution ID
    Tag(0x2010, 0x0500), // Referenced Film Session Sequence
    Tag(0x2050, 0x0500), // Referenced Presentation LUT Sequence
];

/// Attributes of the Image Box Pixel Presentation Module
const IMAGE_BOX_ATTRIBUTES: &[Tag] = &[
    Tag(0x2020, 0x0010), // Image Box Position
    Tag(0x2020, 0x0020), // Polarity
    Tag(0x2020, 0x0030), // Requested Image Size
    Tag(0x2020, 0x0040), // Requested Decimate/Crop Behavior
    Tag(0x2020, 0x0110), // Basic Grayscale Image Sequence
    Tag(0x2010, 0x0060), // Magnification Type
    Tag(0x2010, 0x0080), // Smoothing Type
    Tag(0x2010, 0x0120), // Min Density
    Tag(0x2010, 0x0130), // Max Density
    Tag(0x2010, 0x0150), // Configuration Information
];

/// Print management SOP classes served on the meta SOP class context
const KNOWN_CLASSES: &[&str] = &[
    uids::VERIFICATION,
    uids::BASIC_FILM_SESSION,
    uids::BASIC_FILM_BOX,
    uids::BASIC_GRAYSCALE_IMAGE_BOX,
    uids::PRINTER,
    uids::PRESENTATION_LUT,
];

/// How a served association ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The client released the association
    Released,
    /// The client aborted the association
    Aborted,
    /// The server is shutting down and aborted the association
    Shutdown,
}

enum Watched {
    Answered(DimseMessage),
    Ended(Termination),
}

/// Print SCP for one association
pub struct PrintScp {
    policy: Arc<PrinterPolicy>,
    state: JobState,
    luts: HashMap<String, PresentationLut>,
    relay: Box<dyn UpstreamRelay>,
    enricher: Arc<TagEnricher>,
    cancel: CancellationToken,
}

impl PrintScp {
    /// `cancel` stops the serve loop; it is cancelled when the association
    /// ends so that a relay sharing it is abandoned
    pub fn new(
        policy: Arc<PrinterPolicy>,
        relay: Box<dyn UpstreamRelay>,
        enricher: Arc<TagEnricher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            state: JobState::Idle,
            luts: HashMap::new(),
            relay,
            enricher,
            cancel,
        }
    }

    pub fn policy(&self) -> &PrinterPolicy {
        &self.policy
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn presentation_lut(&self, instance_uid: &str) -> Option<&PresentationLut> {
        self.luts.get(instance_uid)
    }

    /// Serve requests until the association ends
    pub async fn serve<E>(&mut self, exchange: &mut E) -> dimse::Result<Termination>
    where
        E: MessageExchange + ?Sized,
    {
        let result = self.run(exchange).await;
        self.teardown().await;
        result
    }

    async fn run<E>(&mut self, exchange: &mut E) -> dimse::Result<Termination>
    where
        E: MessageExchange + ?Sized,
    {
        let cancel = self.cancel.clone();
        let mut backlog = VecDeque::new();
        loop {
            let received = match backlog.pop_front() {
                Some(rq) => Ok(Received::Message(rq)),
                None => tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Server shutting down, aborting association");
                        exchange.abort().await;
                        return Ok(Termination::Shutdown);
                    }
                    received = exchange.receive() => received,
                },
            };

            match received {
                Ok(Received::Message(rq)) => {
                    let rsp = match self.handle_watched(rq, exchange, &mut backlog).await? {
                        Watched::Answered(rsp) => rsp,
                        Watched::Ended(termination) => return Ok(termination),
                    };
                    if let Err(e) = exchange.send(rsp).await {
                        error!("Failed to send response: {}", e);
                        exchange.abort().await;
                        return Err(e);
                    }
                }
                Ok(Received::Idle) => {
                    debug!("No request within receive timeout ({})", self.state.name());
                }
                Ok(Received::Released) => {
                    info!("Association released ({})", self.state.name());
                    return Ok(Termination::Released);
                }
                Ok(Received::Aborted) => {
                    info!("Association aborted by peer ({})", self.state.name());
                    return Ok(Termination::Aborted);
                }
                Err(e) => {
                    error!("Transport failure: {}", e);
                    exchange.abort().await;
                    return Err(e);
                }
            }
        }
    }

    /// Answer `rq` while watching the exchange. Requests arriving meanwhile
    /// are queued on `backlog`; a release or abort abandons the request and
    /// whatever relay it is waiting on.
    async fn handle_watched<E>(
        &mut self,
        rq: DimseMessage,
        exchange: &mut E,
        backlog: &mut VecDeque<DimseMessage>,
    ) -> dimse::Result<Watched>
    where
        E: MessageExchange + ?Sized,
    {
        let cancel = self.cancel.clone();
        let handling = self.handle(rq);
        tokio::pin!(handling);

        loop {
            tokio::select! {
                rsp = &mut handling => return Ok(Watched::Answered(rsp)),
                received = exchange.receive() => match received {
                    Ok(Received::Message(next)) => backlog.push_back(next),
                    Ok(Received::Idle) => {}
                    Ok(Received::Released) => {
                        info!("Association released while a request was in progress");
                        cancel.cancel();
                        return Ok(Watched::Ended(Termination::Released));
                    }
                    Ok(Received::Aborted) => {
                        info!("Association aborted by peer while a request was in progress");
                        cancel.cancel();
                        return Ok(Watched::Ended(Termination::Aborted));
                    }
                    Err(e) => {
                        error!("Transport failure: {}", e);
                        cancel.cancel();
                        exchange.abort().await;
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Implicit cleanup of everything the association owned
    async fn teardown(&mut self) {
        if let Some(session) = self.state.session() {
            debug!("Discarding film session {}", session.instance_uid);
        }
        self.state = JobState::Idle;
        self.luts.clear();
        self.relay.close().await;
        self.cancel.cancel();
    }

    /// Answer one request
    pub async fn handle(&mut self, rq: DimseMessage) -> DimseMessage {
        debug!(
            "{} {} {}",
            rq.command,
            rq.sop_class_uid,
            rq.sop_instance_uid.as_deref().unwrap_or("-")
        );
        match self.dispatch(&rq).await {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!("{} {} failed: {}", rq.command, rq.sop_class_uid, e);
                rq.response(e.status()).with_error_comment(e.to_string())
            }
        }
    }

    async fn dispatch(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        use DimseCommand::*;

        match (rq.sop_class_uid.as_str(), rq.command) {
            (uids::VERIFICATION, CEchoRq) => Ok(rq.response(status::SUCCESS)),

            (uids::BASIC_FILM_SESSION, NCreateRq) => self.create_session(rq),
            (uids::BASIC_FILM_SESSION, NSetRq) => self.set_session(rq),
            (uids::BASIC_FILM_SESSION, NActionRq) => self.print_session(rq).await,
            (uids::BASIC_FILM_SESSION, NDeleteRq) => self.delete_session(rq),
            (uids::BASIC_FILM_SESSION, NGetRq) => self.get_session(rq),

            (uids::BASIC_FILM_BOX, NCreateRq) => self.create_film_box(rq),
            (uids::BASIC_FILM_BOX, NSetRq) => self.set_film_box(rq),
            (uids::BASIC_FILM_BOX, NActionRq) => self.print_film_box(rq).await,
            (uids::BASIC_FILM_BOX, NDeleteRq) => self.delete_film_box(rq),
            (uids::BASIC_FILM_BOX, NGetRq) => self.get_film_box(rq),

            (uids::BASIC_GRAYSCALE_IMAGE_BOX, NSetRq) => self.set_image_box(rq),

            (uids::PRINTER, NGetRq) => self.get_printer(rq).await,

            (uids::PRESENTATION_LUT, NCreateRq) => self.create_presentation_lut(rq),
            (uids::PRESENTATION_LUT, NDeleteRq) => self.delete_presentation_lut(rq),

            (class, command) if KNOWN_CLASSES.contains(&class) => Err(PrintError::UnrecognizedOperation(
                format!("{} on {}", command, class),
            )),
            (class, _) => Err(PrintError::NoSuchSopClass(class.to_string())),
        }
    }

    // Film Session

    fn create_session(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        if let Some(session) = self.state.session() {
            if rq.sop_instance_uid.as_deref() == Some(session.instance_uid.as_str()) {
                return Err(PrintError::DuplicateInstance(session.instance_uid.clone()));
            }
            return Err(PrintError::protocol(format!(
                "Film session {} already exists",
                session.instance_uid
            )));
        }

        let attributes = rq.dataset.clone().unwrap_or_else(InMemDicomObject::new_empty);
        self.check_attributes(&attributes, SESSION_ATTRIBUTES)?;

        let uid = rq.sop_instance_uid.clone().unwrap_or_else(dimse::new_uid);
        info!("Created film session {}", uid);
        self.state = JobState::SessionOpen(FilmSession::new(uid.clone(), attributes.clone()));

        Ok(rq
            .response(status::SUCCESS)
            .with_instance(uid)
            .with_dataset(attributes))
    }

    fn set_session(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        let session = self
            .state
            .session()
            .ok_or_else(|| PrintError::protocol("N-SET before film session N-CREATE"))?;
        if session.instance_uid != uid {
            return Err(PrintError::no_such_instance(uid));
        }
        let attributes = rq.dataset.clone().unwrap_or_else(InMemDicomObject::new_empty);
        self.check_attributes(&attributes, SESSION_ATTRIBUTES)?;

        if let Some(session) = self.state.session_mut() {
            for element in attributes {
                session.attributes.put(element);
            }
        }
        Ok(rq.response(status::SUCCESS))
    }

    /// Print the open film box, then discard the session
    async fn print_session(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        let session = self
            .state
            .session()
            .ok_or_else(|| PrintError::protocol("N-ACTION before film session N-CREATE"))?;
        if session.instance_uid != uid {
            return Err(PrintError::no_such_instance(uid));
        }
        if self.state.film_box().is_none() {
            return Err(PrintError::EmptyPage(format!("Film session {} has no film box", uid)));
        }

        self.print().await?;
        info!("Printed film session {}", uid);
        self.state = JobState::Idle;
        self.luts.clear();
        Ok(rq.response(status::SUCCESS))
    }

    fn delete_session(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        match self.state.session() {
            Some(session) if session.instance_uid == uid => {}
            _ => return Err(PrintError::no_such_instance(uid)),
        }

        info!("Deleted film session {}", uid);
        self.state = JobState::Idle;
        self.luts.clear();
        Ok(rq.response(status::SUCCESS))
    }

    fn get_session(&self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        match self.state.session() {
            Some(session) if session.instance_uid == uid => Ok(rq
                .response(status::SUCCESS)
                .with_dataset(select_attributes(&session.attributes, &rq.attribute_identifiers))),
            _ => Err(PrintError::no_such_instance(uid)),
        }
    }

    // Film Box

    fn create_film_box(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let attributes = rq.dataset.clone().unwrap_or_else(InMemDicomObject::new_empty);
        let session = self
            .state
            .session()
            .ok_or_else(|| PrintError::protocol("Film box N-CREATE without a film session"))?;

        let referenced = referenced_instances(&attributes, tags::REFERENCED_FILM_SESSION_SEQUENCE);
        if !referenced.is_empty() && !referenced.contains(&session.instance_uid) {
            return Err(PrintError::InvalidAttributeValue(format!(
                "Referenced film session {} does not exist",
                referenced.join(",")
            )));
        }
        self.check_attributes(&attributes, FILM_BOX_ATTRIBUTES)?;
        let lut = self.referenced_lut(&attributes)?;

        let uid = rq.sop_instance_uid.clone().unwrap_or_else(dimse::new_uid);
        let film_box = FilmBox::new(uid.clone(), session, attributes, lut);
        let mut dataset = film_box.attributes.clone();
        dataset.put(film_box.referenced_image_box_sequence());

        if let Some(previous) = self.state.close_box() {
            info!("Film box {} superseded by {}", previous.instance_uid, uid);
        }
        info!("Created film box {} with {} image boxes", uid, film_box.image_boxes.len());
        if let JobState::SessionOpen(session) = std::mem::take(&mut self.state) {
            self.state = JobState::BoxOpen(session, film_box);
        }

        Ok(rq.response(status::SUCCESS).with_instance(uid).with_dataset(dataset))
    }

    fn set_film_box(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        let attributes = rq.dataset.clone().unwrap_or_else(InMemDicomObject::new_empty);
        self.open_box(uid)?;
        self.check_attributes(&attributes, FILM_BOX_ATTRIBUTES)?;
        let lut = self.referenced_lut(&attributes)?;

        let film_box = self.open_box_mut(uid)?;
        if lut.is_some() {
            film_box.presentation_lut = lut;
        }
        film_box.merge(attributes);
        Ok(rq.response(status::SUCCESS))
    }

    async fn print_film_box(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        self.open_box(uid)?;

        self.print().await?;
        if let Some(film_box) = self.state.close_box() {
            info!("Printed film box {}", film_box.instance_uid);
            if let Some(session) = self.state.session_mut() {
                session.printed_boxes.push(film_box.instance_uid);
            }
        }
        Ok(rq.response(status::SUCCESS))
    }

    fn delete_film_box(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        if self.state.film_box().map(|b| b.instance_uid.as_str()) == Some(uid) {
            self.state.close_box();
            info!("Deleted film box {}", uid);
            return Ok(rq.response(status::SUCCESS));
        }
        // clients delete the box they just printed
        match self.state.session() {
            Some(session) if session.printed_boxes.iter().any(|b| b == uid) => {
                debug!("Film box {} already printed", uid);
                Ok(rq.response(status::SUCCESS))
            }
            _ => Err(PrintError::no_such_instance(uid)),
        }
    }

    fn get_film_box(&self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        match self.state.film_box() {
            Some(film_box) if film_box.instance_uid == uid => {
                let mut dataset = film_box.attributes.clone();
                dataset.put(film_box.referenced_image_box_sequence());
                Ok(rq
                    .response(status::SUCCESS)
                    .with_dataset(select_attributes(&dataset, &rq.attribute_identifiers)))
            }
            _ => Err(PrintError::no_such_instance(uid)),
        }
    }

    // Image Box

    fn set_image_box(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        let film_box = self
            .state
            .film_box()
            .ok_or_else(|| PrintError::protocol("Image box N-SET without a film box"))?;
        if film_box.image_box(uid).is_none() {
            return Err(PrintError::no_such_instance(uid));
        }
        let attributes = rq.dataset.clone().unwrap_or_else(InMemDicomObject::new_empty);
        self.check_attributes(&attributes, IMAGE_BOX_ATTRIBUTES)?;

        let image_box = self
            .state
            .film_box_mut()
            .and_then(|film_box| film_box.image_box_mut(uid))
            .ok_or_else(|| PrintError::no_such_instance(uid))?;
        image_box.merge(attributes);
        debug!("Image box {} at position {} set", uid, image_box.position);
        Ok(rq.response(status::SUCCESS))
    }

    // Printer

    async fn get_printer(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        if let Some(uid) = rq.sop_instance_uid.as_deref() {
            if uid != uids::PRINTER_INSTANCE {
                return Err(PrintError::no_such_instance(uid));
            }
        }

        let upstream = self.relay.printer_status().await;
        let printer = relay::resolve_printer_status(self.policy.tolerance, upstream);
        let dataset = InMemDicomObject::from_element_iter([
            DataElement::new(tags::PRINTER_STATUS, VR::CS, PrimitiveValue::from(printer.status.as_str())),
            DataElement::new(
                tags::PRINTER_STATUS_INFO,
                VR::CS,
                PrimitiveValue::from(printer.info.as_str()),
            ),
            DataElement::new(
                tags::PRINTER_NAME,
                VR::LO,
                PrimitiveValue::from(self.policy.ae_title.as_str()),
            ),
        ]);

        Ok(rq
            .response(status::SUCCESS)
            .with_instance(uids::PRINTER_INSTANCE)
            .with_dataset(select_attributes(&dataset, &rq.attribute_identifiers)))
    }

    // Presentation LUT

    fn create_presentation_lut(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = rq.sop_instance_uid.clone().unwrap_or_else(dimse::new_uid);
        if self.luts.contains_key(&uid) {
            return Err(PrintError::DuplicateInstance(uid));
        }

        let attributes = rq.dataset.clone().unwrap_or_else(InMemDicomObject::new_empty);
        info!("Created Presentation LUT {}", uid);
        self.luts.insert(
            uid.clone(),
            PresentationLut {
                instance_uid: uid.clone(),
                attributes: attributes.clone(),
            },
        );
        Ok(rq
            .response(status::SUCCESS)
            .with_instance(uid)
            .with_dataset(attributes))
    }

    fn delete_presentation_lut(&mut self, rq: &DimseMessage) -> Result<DimseMessage> {
        let uid = requested_uid(rq)?;
        if self.luts.remove(uid).is_none() {
            return Err(PrintError::no_such_instance(uid));
        }
        if let Some(film_box) = self.state.film_box_mut() {
            if film_box.presentation_lut.as_deref() == Some(uid) {
                film_box.presentation_lut = None;
            }
        }
        info!("Deleted Presentation LUT {}", uid);
        Ok(rq.response(status::SUCCESS))
    }

    // Helpers

    /// Assemble, enrich and relay the open film box. The state is left
    /// untouched; the caller consumes the box on success.
    async fn print(&mut self) -> Result<()> {
        let (session, film_box) = match &self.state {
            JobState::BoxOpen(session, film_box) => (session.clone(), film_box.clone()),
            _ => return Err(PrintError::protocol("N-ACTION without a film box")),
        };
        if film_box.populated_count() == 0 {
            return Err(PrintError::EmptyPage(format!(
                "Film box {} has no image content",
                film_box.instance_uid
            )));
        }

        let presentation_lut = film_box
            .presentation_lut
            .as_ref()
            .and_then(|uid| self.luts.get(uid))
            .cloned();
        let mut job = PrintJob {
            printer: self.policy.ae_title.clone(),
            session,
            film_box,
            presentation_lut,
        };
        job.stamp_identifiers();

        let insertions = self
            .enricher
            .enrich_image(job.first_image(), &self.policy.tag_rules, &self.policy.hint)
            .await;
        if !insertions.is_empty() {
            debug!("Inserting {} recognized attributes", insertions.len());
            job.for_each_image(|image| apply_insertions(image, &insertions));
        }

        let outcome = self.relay.relay(&job).await;
        relay::reconcile(self.policy.tolerance, outcome)
    }

    fn open_box(&self, uid: &str) -> Result<&FilmBox> {
        match self.state.film_box() {
            Some(film_box) if film_box.instance_uid == uid => Ok(film_box),
            Some(_) => Err(PrintError::no_such_instance(uid)),
            None => Err(PrintError::protocol(format!(
                "No film box open ({})",
                self.state.name()
            ))),
        }
    }

    fn open_box_mut(&mut self, uid: &str) -> Result<&mut FilmBox> {
        match self.state.film_box_mut() {
            Some(film_box) if film_box.instance_uid == uid => Ok(film_box),
            Some(_) => Err(PrintError::no_such_instance(uid)),
            None => Err(PrintError::protocol("No film box open")),
        }
    }

    /// Presentation LUT named by a Referenced Presentation LUT Sequence
    fn referenced_lut(&self, attributes: &InMemDicomObject) -> Result<Option<String>> {
        let referenced = referenced_instances(attributes, tags::REFERENCED_PRESENTATION_LUT_SEQUENCE);
        match referenced.first() {
            None => Ok(None),
            Some(uid) if self.luts.contains_key(uid) => Ok(Some(uid.clone())),
            Some(uid) => Err(PrintError::InvalidAttributeValue(format!(
                "Referenced Presentation LUT {} does not exist",
                uid
            ))),
        }
    }

    /// Strict printers reject attributes outside the module
    fn check_attributes(&self, attributes: &InMemDicomObject, allowed: &[Tag]) -> Result<()> {
        if !self.policy.strict_attributes {
            return Ok(());
        }
        match attributes.iter().map(|e| e.tag()).find(|tag| !allowed.contains(tag)) {
            Some(tag) => Err(PrintError::NoSuchAttribute(tag)),
            None => Ok(()),
        }
    }
}

fn requested_uid(rq: &DimseMessage) -> Result<&str> {
    rq.sop_instance_uid
        .as_deref()
        .ok_or_else(|| PrintError::protocol(format!("{} without a Requested SOP Instance UID", rq.command)))
}

/// Restrict a dataset to an Attribute Identifier List; empty means all
fn select_attributes(dataset: &InMemDicomObject, identifiers: &[Tag]) -> InMemDicomObject {
    if identifiers.is_empty() {
        return dataset.clone();
    }
    InMemDicomObject::from_element_iter(
        dataset
            .iter()
            .filter(|e| identifiers.contains(&e.tag()))
            .cloned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enricher::{BitmapDecoder, EnrichError, RecognitionHint, TextRecognizer};
    use crate::relay::NoUpstream;
    use async_trait::async_trait;
    use dicom_pixeldata::image::DynamicImage;
    use dimse::InMemoryExchange;

    struct Blind;

    #[async_trait]
    impl TextRecognizer for Blind {
        async fn recognize(&self, _: &DynamicImage, _: &RecognitionHint) -> Option<String> {
            None
        }
    }

    impl BitmapDecoder for Blind {
        fn decode(&self, _: &InMemDicomObject) -> std::result::Result<DynamicImage, EnrichError> {
            Err(EnrichError::Decode("no pixels".into()))
        }
    }

    fn scp(policy: PrinterPolicy) -> PrintScp {
        PrintScp::new(
            Arc::new(policy),
            Box::new(NoUpstream),
            Arc::new(TagEnricher::new(Arc::new(Blind), Arc::new(Blind))),
            CancellationToken::new(),
        )
    }

    fn request(command: DimseCommand, class: &str, instance: Option<&str>) -> DimseMessage {
        DimseMessage::request(command, 1, class, instance.map(String::from))
    }

    #[test]
    fn test_unknown_class_and_operation() {
        tokio_test::block_on(async {
            let mut scp = scp(PrinterPolicy::new("PRINTSCP"));

            let rsp = scp
                .handle(request(DimseCommand::NGetRq, uids::SECONDARY_CAPTURE, None))
                .await;
            assert_eq!(rsp.status, Some(status::NO_SUCH_SOP_CLASS));

            let rsp = scp
                .handle(request(DimseCommand::NGetRq, uids::PRESENTATION_LUT, Some("1.2.3")))
                .await;
            assert_eq!(rsp.status, Some(status::UNRECOGNIZED_OPERATION));
            assert!(matches!(scp.state(), JobState::Idle));
        });
    }

    #[tokio::test]
    async fn test_strict_printer_rejects_unknown_attributes() {
        let mut lenient = scp(PrinterPolicy::new("PRINTSCP"));
        let mut strict = scp(PrinterPolicy::new("PRINTSCP").with_strict_attributes(true));

        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(Tag(0x0009, 0x1001), VR::LO, PrimitiveValue::from("private")));
        let rq = request(DimseCommand::NCreateRq, uids::BASIC_FILM_SESSION, None).with_dataset(dataset);

        let rsp = lenient.handle(rq.clone()).await;
        assert_eq!(rsp.status, Some(status::SUCCESS));
        assert!(rsp.dataset.unwrap().element(Tag(0x0009, 0x1001)).is_ok());

        let rsp = strict.handle(rq).await;
        assert_eq!(rsp.status, Some(status::NO_SUCH_ATTRIBUTE));
        assert!(matches!(strict.state(), JobState::Idle));
    }

    #[tokio::test]
    async fn test_printer_get_filters_attributes() {
        let mut scp = scp(PrinterPolicy::new("PRINTSCP"));
        let rq = request(DimseCommand::NGetRq, uids::PRINTER, Some(uids::PRINTER_INSTANCE))
            .with_attribute_identifiers(vec![tags::PRINTER_STATUS]);

        let rsp = scp.handle(rq).await;
        assert_eq!(rsp.status, Some(status::SUCCESS));
        let dataset = rsp.dataset.unwrap();
        assert_eq!(dataset.element(tags::PRINTER_STATUS).unwrap().to_str().unwrap(), "NORMAL");
        assert!(dataset.element(tags::PRINTER_NAME).is_err());

        let rsp = scp
            .handle(request(DimseCommand::NGetRq, uids::PRINTER, Some("1.2.3")))
            .await;
        assert_eq!(rsp.status, Some(status::NO_SUCH_SOP_INSTANCE));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_idle_association() {
        let cancel = CancellationToken::new();
        let mut scp = PrintScp::new(
            Arc::new(PrinterPolicy::new("PRINTSCP")),
            Box::new(NoUpstream),
            Arc::new(TagEnricher::new(Arc::new(Blind), Arc::new(Blind))),
            cancel.clone(),
        );
        let (mut exchange, _peer) = InMemoryExchange::pair(Some(std::time::Duration::from_millis(10)));

        cancel.cancel();
        let termination = scp.serve(&mut exchange).await.unwrap();
        assert_eq!(termination, Termination::Shutdown);
        assert!(exchange.was_aborted());
    }
}
