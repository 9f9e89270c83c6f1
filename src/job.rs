//! Print job objects and the per-association job state

use chrono::{DateTime, Utc};
use dicom_core::header::Header;
use dicom_core::value::DataSetSequence;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dimse::types::uids;

/// Root of a print job
#[derive(Debug, Clone)]
pub struct FilmSession {
    pub instance_uid: String,
    pub study_uid: String,
    pub series_uid: String,
    pub attributes: InMemDicomObject,
    /// Film boxes printed and consumed within this session
    pub printed_boxes: Vec<String>,
    pub created: DateTime<Utc>,
}

impl FilmSession {
    pub fn new(instance_uid: impl Into<String>, attributes: InMemDicomObject) -> Self {
        Self {
            instance_uid: instance_uid.into(),
            study_uid: dimse::new_uid(),
            series_uid: dimse::new_uid(),
            attributes,
            printed_boxes: Vec::new(),
            created: Utc::now(),
        }
    }
}

/// One image position of a film box
#[derive(Debug, Clone)]
pub struct ImageBox {
    pub instance_uid: String,
    pub position: u16,
    /// Image box attributes other than the image itself
    pub attributes: InMemDicomObject,
    /// Item of the Basic Grayscale Image Sequence
    pub image: Option<InMemDicomObject>,
}

impl ImageBox {
    fn new(position: u16) -> Self {
        let mut attributes = InMemDicomObject::new_empty();
        attributes.put(DataElement::new(
            tags::IMAGE_BOX_POSITION,
            VR::US,
            PrimitiveValue::from(position),
        ));
        Self {
            instance_uid: dimse::new_uid(),
            position,
            attributes,
            image: None,
        }
    }

    /// An image box counts once it has received image content
    pub fn is_populated(&self) -> bool {
        self.image.is_some()
    }

    /// Merge an N-SET dataset; the image sequence item replaces the image
    pub fn merge(&mut self, dataset: InMemDicomObject) {
        for element in dataset {
            if element.tag() == tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE {
                if let Some(item) = element.items().and_then(|items| items.first()) {
                    self.image = Some(item.clone());
                }
            } else if element.tag() != tags::IMAGE_BOX_POSITION {
                self.attributes.put(element);
            }
        }
    }

    /// Full dataset for forwarding: attributes plus the image sequence
    pub fn to_dataset(&self) -> InMemDicomObject {
        let mut dataset = self.attributes.clone();
        if let Some(image) = &self.image {
            dataset.put(DataElement::new(
                tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![image.clone()]),
            ));
        }
        dataset
    }
}

/// A page of the film session
#[derive(Debug, Clone)]
pub struct FilmBox {
    pub instance_uid: String,
    pub study_uid: String,
    pub series_uid: String,
    pub attributes: InMemDicomObject,
    pub image_boxes: Vec<ImageBox>,
    pub presentation_lut: Option<String>,
    pub created: DateTime<Utc>,
}

impl FilmBox {
    /// Create a film box in `session`, laying out image boxes from the
    /// Image Display Format
    pub fn new(
        instance_uid: impl Into<String>,
        session: &FilmSession,
        attributes: InMemDicomObject,
        presentation_lut: Option<String>,
    ) -> Self {
        let format = element_str(&attributes, tags::IMAGE_DISPLAY_FORMAT).unwrap_or_default();
        let count = image_box_count(&format);
        let image_boxes = (1..=count as u16).map(ImageBox::new).collect();

        Self {
            instance_uid: instance_uid.into(),
            study_uid: session.study_uid.clone(),
            series_uid: session.series_uid.clone(),
            attributes,
            image_boxes,
            presentation_lut,
            created: Utc::now(),
        }
    }

    pub fn image_box(&self, instance_uid: &str) -> Option<&ImageBox> {
        self.image_boxes.iter().find(|b| b.instance_uid == instance_uid)
    }

    pub fn image_box_mut(&mut self, instance_uid: &str) -> Option<&mut ImageBox> {
        self.image_boxes
            .iter_mut()
            .find(|b| b.instance_uid == instance_uid)
    }

    pub fn populated_count(&self) -> usize {
        self.image_boxes.iter().filter(|b| b.is_populated()).count()
    }

    /// Merge an N-SET dataset into the box attributes
    pub fn merge(&mut self, dataset: InMemDicomObject) {
        for element in dataset {
            self.attributes.put(element);
        }
    }

    /// Referenced Image Box Sequence, in position order
    pub fn referenced_image_box_sequence(&self) -> InMemElement {
        let items: Vec<InMemDicomObject> = self
            .image_boxes
            .iter()
            .map(|b| {
                InMemDicomObject::from_element_iter([
                    DataElement::new(
                        tags::REFERENCED_SOP_CLASS_UID,
                        VR::UI,
                        PrimitiveValue::from(uids::BASIC_GRAYSCALE_IMAGE_BOX),
                    ),
                    DataElement::new(
                        tags::REFERENCED_SOP_INSTANCE_UID,
                        VR::UI,
                        PrimitiveValue::from(b.instance_uid.as_str()),
                    ),
                ])
            })
            .collect();
        DataElement::new(
            tags::REFERENCED_IMAGE_BOX_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(items),
        )
    }
}

/// A Presentation LUT created by the client
#[derive(Debug, Clone)]
pub struct PresentationLut {
    pub instance_uid: String,
    pub attributes: InMemDicomObject,
}

/// Job state of one association.
///
/// At most one film session exists, and at most one film box within it.
#[derive(Debug, Clone, Default)]
pub enum JobState {
    #[default]
    Idle,
    SessionOpen(FilmSession),
    BoxOpen(FilmSession, FilmBox),
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Idle => "Idle",
            JobState::SessionOpen(_) => "SessionOpen",
            JobState::BoxOpen(..) => "BoxOpen",
        }
    }

    pub fn session(&self) -> Option<&FilmSession> {
        match self {
            JobState::Idle => None,
            JobState::SessionOpen(session) | JobState::BoxOpen(session, _) => Some(session),
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut FilmSession> {
        match self {
            JobState::Idle => None,
            JobState::SessionOpen(session) | JobState::BoxOpen(session, _) => Some(session),
        }
    }

    pub fn film_box(&self) -> Option<&FilmBox> {
        match self {
            JobState::BoxOpen(_, film_box) => Some(film_box),
            _ => None,
        }
    }

    pub fn film_box_mut(&mut self) -> Option<&mut FilmBox> {
        match self {
            JobState::BoxOpen(_, film_box) => Some(film_box),
            _ => None,
        }
    }

    /// Drop the film box, keeping the session
    pub fn close_box(&mut self) -> Option<FilmBox> {
        match std::mem::take(self) {
            JobState::BoxOpen(session, film_box) => {
                *self = JobState::SessionOpen(session);
                Some(film_box)
            }
            other => {
                *self = other;
                None
            }
        }
    }
}

/// A fully assembled film box, handed to the upstream relay
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub printer: String,
    pub session: FilmSession,
    pub film_box: FilmBox,
    pub presentation_lut: Option<PresentationLut>,
}

impl PrintJob {
    /// Image boxes with content, in position order
    pub fn populated_image_boxes(&self) -> impl Iterator<Item = &ImageBox> {
        self.film_box.image_boxes.iter().filter(|b| b.is_populated())
    }

    /// First image of the page, the one text is recognized on
    pub fn first_image(&self) -> Option<&InMemDicomObject> {
        self.populated_image_boxes().find_map(|b| b.image.as_ref())
    }

    /// Apply `f` to every image dataset of the page
    pub fn for_each_image(&mut self, mut f: impl FnMut(&mut InMemDicomObject)) {
        for image_box in &mut self.film_box.image_boxes {
            if let Some(image) = image_box.image.as_mut() {
                f(image);
            }
        }
    }

    /// Stamp the study and series identifiers into every image
    pub fn stamp_identifiers(&mut self) {
        let study = self.film_box.study_uid.clone();
        let series = self.film_box.series_uid.clone();
        self.for_each_image(|image| {
            image.put(DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(study.as_str()),
            ));
            image.put(DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(series.as_str()),
            ));
        });
    }
}

/// Upper bound on image boxes per film box
const MAX_IMAGE_BOXES: usize = 256;

/// Number of image boxes for an Image Display Format value.
///
/// `STANDARD\C,R` gives C×R, `ROW\a,b,..` and `COL\a,b,..` the sum of the
/// list; anything else is a single image box.
pub fn image_box_count(format: &str) -> usize {
    let format = format.trim();
    let (kind, args) = match format.split_once('\\') {
        Some((kind, args)) => (kind.trim().to_ascii_uppercase(), args),
        None => return 1,
    };
    let numbers: Option<Vec<usize>> = args
        .split(',')
        .map(|n| n.trim().parse::<usize>().ok().filter(|n| *n > 0))
        .collect();

    let count = match (kind.as_str(), numbers) {
        ("STANDARD", Some(n)) if n.len() == 2 => n[0].saturating_mul(n[1]),
        ("ROW", Some(n)) | ("COL", Some(n)) if !n.is_empty() => {
            n.iter().fold(0usize, |total, n| total.saturating_add(*n))
        }
        _ => 1,
    };
    count.clamp(1, MAX_IMAGE_BOXES)
}

/// Trimmed string value of an attribute
pub fn element_str(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    dataset
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()).trim_start().to_string())
        .filter(|s| !s.is_empty())
}

/// Reference sequence with a single item naming `instance_uid`
pub fn reference_sequence(sequence: Tag, sop_class_uid: &str, instance_uid: &str) -> InMemElement {
    let item = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::REFERENCED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(instance_uid),
        ),
    ]);
    DataElement::new(sequence, VR::SQ, DataSetSequence::from(vec![item]))
}

/// Referenced SOP Instance UIDs in the items of a reference sequence
pub fn referenced_instances(dataset: &InMemDicomObject, sequence: Tag) -> Vec<String> {
    dataset
        .element(sequence)
        .ok()
        .and_then(|e| e.items())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| element_str(item, tags::REFERENCED_SOP_INSTANCE_UID))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn film_box(format: &str) -> FilmBox {
        let session = FilmSession::new("1.2.3", InMemDicomObject::new_empty());
        let attributes = InMemDicomObject::from_element_iter([DataElement::new(
            tags::IMAGE_DISPLAY_FORMAT,
            VR::ST,
            PrimitiveValue::from(format),
        )]);
        FilmBox::new("1.2.3.4", &session, attributes, None)
    }

    fn image_dataset() -> InMemDicomObject {
        let image = InMemDicomObject::from_element_iter([DataElement::new(
            tags::ROWS,
            VR::US,
            PrimitiveValue::from(16_u16),
        )]);
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::POLARITY, VR::CS, PrimitiveValue::from("NORMAL")),
            DataElement::new(
                tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![image]),
            ),
        ])
    }

    #[test]
    fn test_image_box_count() {
        assert_eq!(image_box_count("STANDARD\\1,1"), 1);
        assert_eq!(image_box_count("STANDARD\\2,3"), 6);
        assert_eq!(image_box_count("ROW\\2,1"), 3);
        assert_eq!(image_box_count("COL\\1,2,3"), 6);
        assert_eq!(image_box_count("SLIDE"), 1);
        assert_eq!(image_box_count("STANDARD\\x,2"), 1);
        assert_eq!(image_box_count(""), 1);
        // oversized layouts are capped instead of overflowing
        assert_eq!(image_box_count("STANDARD\\4294967296,4294967296"), 256);
        assert_eq!(image_box_count("ROW\\18446744073709551615,1"), 256);
        assert_eq!(image_box_count("STANDARD\\99999999999999999999,2"), 1);
    }

    #[test]
    fn test_film_box_layout_and_references() {
        let film_box = film_box("STANDARD\\2,2");
        assert_eq!(film_box.image_boxes.len(), 4);
        assert_eq!(film_box.image_boxes[3].position, 4);
        assert_eq!(film_box.populated_count(), 0);

        let mut response = InMemDicomObject::new_empty();
        response.put(film_box.referenced_image_box_sequence());
        let refs = referenced_instances(&response, tags::REFERENCED_IMAGE_BOX_SEQUENCE);
        assert_eq!(refs.len(), 4);
        assert_eq!(refs[0], film_box.image_boxes[0].instance_uid);
    }

    #[test]
    fn test_image_box_merge() {
        let mut film_box = film_box("STANDARD\\1,2");
        let uid = film_box.image_boxes[1].instance_uid.clone();

        film_box.image_box_mut(&uid).unwrap().merge(image_dataset());
        assert_eq!(film_box.populated_count(), 1);

        let image_box = film_box.image_box(&uid).unwrap();
        assert_eq!(element_str(&image_box.attributes, tags::POLARITY).as_deref(), Some("NORMAL"));
        let dataset = image_box.to_dataset();
        assert!(dataset.element(tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE).is_ok());
        assert_eq!(
            dataset.element(tags::IMAGE_BOX_POSITION).unwrap().to_int::<u16>().unwrap(),
            2
        );
    }

    #[test]
    fn test_close_box_keeps_session() {
        let session = FilmSession::new("1.2.3", InMemDicomObject::new_empty());
        let film_box = FilmBox::new("1.2.3.4", &session, InMemDicomObject::new_empty(), None);
        let mut state = JobState::BoxOpen(session, film_box);

        assert_eq!(state.close_box().map(|b| b.instance_uid), Some("1.2.3.4".to_string()));
        assert_eq!(state.name(), "SessionOpen");
        assert!(state.close_box().is_none());
        assert_eq!(state.session().map(|s| s.instance_uid.as_str()), Some("1.2.3"));
    }

    #[test]
    fn test_stamp_identifiers() {
        let mut film_box = film_box("STANDARD\\1,1");
        film_box.image_boxes[0].merge(image_dataset());
        let session = FilmSession::new("1.2.3", InMemDicomObject::new_empty());
        let mut job = PrintJob {
            printer: "PRINTSCP".into(),
            session,
            film_box,
            presentation_lut: None,
        };

        job.stamp_identifiers();
        let image = job.first_image().unwrap();
        assert_eq!(
            element_str(image, tags::STUDY_INSTANCE_UID),
            Some(job.film_box.study_uid.clone())
        );
    }
}
