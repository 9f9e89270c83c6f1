//! Tag enrichment from text burned into printed images
//!
//! At print time the rendered image of a film box is decoded to a bitmap,
//! configured regions are handed to a [`TextRecognizer`] and the text is
//! mapped to dataset attributes. Recognition is best effort: a missing
//! bitmap, an empty region or a recognizer failure simply yields fewer
//! insertions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_pixeldata::image::{self as img, DynamicImage, ImageEncoder};
use dicom_pixeldata::PixelDecoder;
use dimse::types::uids;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{RecognitionConfig, RegionConfig, TagRuleConfig};

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Text recognition failed: {0}")]
    Recognition(String),
}

/// Rectangle of the rendered bitmap, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<RegionConfig> for Region {
    fn from(r: RegionConfig) -> Self {
        Self {
            x: r.x,
            y: r.y,
            width: r.width,
            height: r.height,
        }
    }
}

/// Recognizer settings selected by printer policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionHint {
    pub language: String,
    pub whitelist: Option<String>,
    pub page_segmentation: Option<u8>,
}

impl Default for RecognitionHint {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            whitelist: None,
            page_segmentation: None,
        }
    }
}

impl From<&RecognitionConfig> for RecognitionHint {
    fn from(c: &RecognitionConfig) -> Self {
        Self {
            language: c.language.clone(),
            whitelist: c.whitelist.clone(),
            page_segmentation: c.page_segmentation,
        }
    }
}

/// Where the value of an inserted attribute comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSource {
    /// Fixed value
    Value(String),
    /// Text recognized in a region of the image
    Region {
        region: Region,
        strip_prefix: Option<String>,
    },
}

/// Attribute insertion rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRule {
    pub tag: Tag,
    pub vr: VR,
    pub source: TagSource,
}

impl TagRule {
    /// Rule inserting a fixed value
    pub fn value(tag: Tag, value: impl Into<String>) -> Self {
        Self {
            tag,
            vr: text_vr(tag).unwrap_or(VR::LO),
            source: TagSource::Value(value.into()),
        }
    }

    /// Rule inserting text recognized in `region`
    pub fn region(tag: Tag, region: Region, strip_prefix: Option<String>) -> Self {
        Self {
            tag,
            vr: text_vr(tag).unwrap_or(VR::LO),
            source: TagSource::Region {
                region,
                strip_prefix,
            },
        }
    }

    pub fn from_config(config: &TagRuleConfig) -> Option<Self> {
        let (tag, _) = resolve_tag(&config.tag)?;
        match (&config.value, config.region) {
            (Some(value), None) => Some(Self::value(tag, value.clone())),
            (None, Some(region)) => Some(Self::region(tag, region.into(), config.strip_prefix.clone())),
            _ => None,
        }
    }
}

/// An attribute to put into an outgoing dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    pub tag: Tag,
    pub vr: VR,
    pub value: String,
}

/// Parse a tag from a keyword, `(gggg,eeee)` or `ggggeeee`
pub fn parse_tag(tag_str: &str) -> Option<Tag> {
    let tag_str = tag_str.trim();
    if let Some(tag) = StandardDataDictionary.parse_tag(tag_str) {
        return Some(tag);
    }

    if tag_str.len() == 8 {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(&tag_str[0..4], 16),
            u16::from_str_radix(&tag_str[4..8], 16),
        ) {
            return Some(Tag(group, element));
        }
    }
    None
}

/// Tag and VR of an attribute that can receive recognized text
pub fn resolve_tag(tag_str: &str) -> Option<(Tag, VR)> {
    let tag = parse_tag(tag_str)?;
    Some((tag, text_vr(tag)?))
}

/// Dictionary VR of `tag` if it is a text VR; private tags are treated as LO
fn text_vr(tag: Tag) -> Option<VR> {
    let vr = match StandardDataDictionary.by_tag(tag) {
        Some(entry) => entry.vr.relaxed(),
        None if tag.group() % 2 == 1 => VR::LO,
        None => return None,
    };
    match vr {
        VR::AE | VR::AS | VR::CS | VR::DA | VR::DS | VR::DT | VR::IS | VR::LO | VR::LT
        | VR::PN | VR::SH | VR::ST | VR::TM | VR::UC | VR::UI | VR::UT => Some(vr),
        _ => None,
    }
}

fn max_len(vr: VR) -> usize {
    match vr {
        VR::AE | VR::CS | VR::SH => 16,
        VR::LO | VR::PN | VR::UI => 64,
        VR::LT => 10240,
        VR::ST => 1024,
        _ => usize::MAX,
    }
}

/// Normalise recognized text into an attribute value
fn clean_text(raw: &str, strip_prefix: Option<&str>, vr: VR) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut text = joined.as_str();
    if let Some(prefix) = strip_prefix {
        text = text.strip_prefix(prefix).unwrap_or(text).trim();
    }
    if text.is_empty() {
        return None;
    }

    let mut value = if vr == VR::CS {
        text.to_uppercase()
    } else {
        text.to_string()
    };
    if vr == VR::PN {
        value = value.replace(' ', "^");
    }
    let limit = max_len(vr);
    if value.chars().count() > limit {
        value = value.chars().take(limit).collect();
    }
    Some(value)
}

/// Turns a bitmap region into text
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Recognized text, or `None` when nothing usable was found
    async fn recognize(&self, region: &DynamicImage, hint: &RecognitionHint) -> Option<String>;
}

/// Turns an image dataset into a bitmap
pub trait BitmapDecoder: Send + Sync {
    fn decode(&self, image: &InMemDicomObject) -> Result<DynamicImage, EnrichError>;
}

/// Decodes native pixel data with `dicom-pixeldata`
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelDataDecoder;

impl BitmapDecoder for PixelDataDecoder {
    fn decode(&self, image: &InMemDicomObject) -> Result<DynamicImage, EnrichError> {
        // image box content arrives without file meta; wrap it so the
        // pixel data pipeline knows its transfer syntax
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE)
            .media_storage_sop_instance_uid(dimse::new_uid())
            .transfer_syntax(uids::EXPLICIT_VR_LE)
            .build()
            .map_err(|e| EnrichError::Decode(e.to_string()))?;
        let file = image.clone().with_exact_meta(meta);

        let pixels = file
            .decode_pixel_data()
            .map_err(|e| EnrichError::Decode(e.to_string()))?;
        pixels
            .to_dynamic_image(0)
            .map_err(|e| EnrichError::Decode(e.to_string()))
    }
}

/// Runs the `tesseract` command line tool on a temporary PNG
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    command: String,
    timeout: Duration,
}

impl TesseractRecognizer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn run(&self, region: &DynamicImage, hint: &RecognitionHint) -> Result<String, EnrichError> {
        let mut png: Vec<u8> = Vec::new();
        img::codecs::png::PngEncoder::new(&mut png)
            .write_image(
                region.as_bytes(),
                region.width(),
                region.height(),
                region.color().into(),
            )
            .map_err(|e| EnrichError::Recognition(format!("png encode: {}", e)))?;

        let file = tempfile::Builder::new()
            .prefix("printscp-ocr-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EnrichError::Recognition(e.to_string()))?;
        tokio::fs::write(file.path(), &png)
            .await
            .map_err(|e| EnrichError::Recognition(e.to_string()))?;

        let mut cmd = Command::new(&self.command);
        cmd.arg(file.path())
            .arg("stdout")
            .arg("-l")
            .arg(&hint.language)
            .kill_on_drop(true);
        if let Some(psm) = hint.page_segmentation {
            cmd.arg("--psm").arg(psm.to_string());
        }
        if let Some(whitelist) = &hint.whitelist {
            cmd.arg("-c").arg(format!("tessedit_char_whitelist={}", whitelist));
        }
        debug!("Running: {} {} stdout -l {}", self.command, file.path().display(), hint.language);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| EnrichError::Recognition(format!("{} timed out", self.command)))?
            .map_err(|e| EnrichError::Recognition(format!("Failed to spawn {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnrichError::Recognition(format!(
                "{} failed: {:?} {}",
                self.command,
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, region: &DynamicImage, hint: &RecognitionHint) -> Option<String> {
        match self.run(region, hint).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}

/// Computes attribute insertions for a printed film box
#[derive(Clone)]
pub struct TagEnricher {
    recognizer: Arc<dyn TextRecognizer>,
    decoder: Arc<dyn BitmapDecoder>,
}

impl TagEnricher {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, decoder: Arc<dyn BitmapDecoder>) -> Self {
        Self {
            recognizer,
            decoder,
        }
    }

    /// Map a bitmap and rules to insertions.
    ///
    /// Region rules are skipped when no bitmap is available, when the region
    /// lies outside the bitmap, or when nothing is recognized.
    pub async fn enrich(
        &self,
        bitmap: Option<&DynamicImage>,
        rules: &[TagRule],
        hint: &RecognitionHint,
    ) -> Vec<Insertion> {
        let mut insertions = Vec::new();
        for rule in rules {
            let value = match &rule.source {
                TagSource::Value(value) => clean_text(value, None, rule.vr),
                TagSource::Region {
                    region,
                    strip_prefix,
                } => {
                    let Some(bitmap) = bitmap else {
                        continue;
                    };
                    if region.x >= bitmap.width() || region.y >= bitmap.height() {
                        warn!("Region {:?} for {} lies outside the {}x{} image", region, rule.tag, bitmap.width(), bitmap.height());
                        continue;
                    }
                    let crop = bitmap.crop_imm(region.x, region.y, region.width, region.height);
                    match self.recognizer.recognize(&crop, hint).await {
                        Some(text) => clean_text(&text, strip_prefix.as_deref(), rule.vr),
                        None => None,
                    }
                }
            };

            match value {
                Some(value) => {
                    debug!("Inserting {} = {:?}", rule.tag, value);
                    insertions.push(Insertion {
                        tag: rule.tag,
                        vr: rule.vr,
                        value,
                    });
                }
                None => debug!("No value recognized for {}", rule.tag),
            }
        }
        insertions
    }

    /// Decode `image` and compute insertions for it
    pub async fn enrich_image(
        &self,
        image: Option<&InMemDicomObject>,
        rules: &[TagRule],
        hint: &RecognitionHint,
    ) -> Vec<Insertion> {
        if rules.is_empty() {
            return Vec::new();
        }

        let needs_bitmap = rules
            .iter()
            .any(|r| matches!(r.source, TagSource::Region { .. }));
        let bitmap = match image {
            Some(image) if needs_bitmap => match self.decoder.decode(image) {
                Ok(bitmap) => Some(bitmap),
                Err(e) => {
                    warn!("Skipping text recognition: {}", e);
                    None
                }
            },
            _ => None,
        };

        self.enrich(bitmap.as_ref(), rules, hint).await
    }
}

/// Put each insertion into `dataset`, replacing existing values
pub fn apply_insertions(dataset: &mut InMemDicomObject, insertions: &[Insertion]) {
    for insertion in insertions {
        dataset.put(DataElement::new(
            insertion.tag,
            insertion.vr,
            PrimitiveValue::from(insertion.value.as_str()),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;
    use dicom_pixeldata::image::{GrayImage, Luma};
    use std::sync::Mutex;

    /// Returns a fixed text and records the size of each region it saw
    struct FixedRecognizer {
        text: Option<String>,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl FixedRecognizer {
        fn new(text: Option<&str>) -> Self {
            Self {
                text: text.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextRecognizer for FixedRecognizer {
        async fn recognize(&self, region: &DynamicImage, _hint: &RecognitionHint) -> Option<String> {
            self.seen.lock().unwrap().push((region.width(), region.height()));
            self.text.clone()
        }
    }

    struct FailingDecoder;

    impl BitmapDecoder for FailingDecoder {
        fn decode(&self, _image: &InMemDicomObject) -> Result<DynamicImage, EnrichError> {
            Err(EnrichError::Decode("no pixel data".into()))
        }
    }

    fn bitmap() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(100, 50, Luma([255u8])))
    }

    fn region(x: u32, y: u32, width: u32, height: u32) -> Region {
        Region { x, y, width, height }
    }

    #[test]
    fn test_parse_tag_formats() {
        assert_eq!(parse_tag("PatientName"), Some(tags::PATIENT_NAME));
        assert_eq!(parse_tag("(0010,0020)"), Some(tags::PATIENT_ID));
        assert_eq!(parse_tag("00080080"), Some(tags::INSTITUTION_NAME));
        assert_eq!(parse_tag("NotAKeyword"), None);
    }

    #[test]
    fn test_resolve_tag_requires_text_vr() {
        assert_eq!(resolve_tag("PatientName"), Some((tags::PATIENT_NAME, VR::PN)));
        assert_eq!(resolve_tag("Rows"), None);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(
            clean_text("  NAME: DOE JOHN \n", Some("NAME:"), VR::PN),
            Some("DOE^JOHN".to_string())
        );
        assert_eq!(clean_text("   \n ", None, VR::LO), None);
        assert_eq!(clean_text("ct", None, VR::CS), Some("CT".to_string()));
        assert_eq!(clean_text(&"a".repeat(80), None, VR::LO).map(|v| v.len()), Some(64));
    }

    #[tokio::test]
    async fn test_enrich_maps_recognized_text() {
        let recognizer = Arc::new(FixedRecognizer::new(Some("ID: 12345\n")));
        let enricher = TagEnricher::new(recognizer.clone(), Arc::new(PixelDataDecoder));
        let rules = vec![
            TagRule::region(tags::PATIENT_ID, region(10, 10, 40, 20), Some("ID:".into())),
            TagRule::value(tags::INSTITUTION_NAME, "Central Hospital"),
        ];

        let bitmap = bitmap();
        let insertions = enricher
            .enrich(Some(&bitmap), &rules, &RecognitionHint::default())
            .await;

        assert_eq!(insertions.len(), 2);
        assert_eq!(insertions[0].tag, tags::PATIENT_ID);
        assert_eq!(insertions[0].value, "12345");
        assert_eq!(insertions[1].value, "Central Hospital");
        assert_eq!(recognizer.seen.lock().unwrap().as_slice(), &[(40, 20)]);
    }

    #[tokio::test]
    async fn test_region_is_clamped_or_skipped() {
        let recognizer = Arc::new(FixedRecognizer::new(Some("X")));
        let enricher = TagEnricher::new(recognizer.clone(), Arc::new(PixelDataDecoder));
        let rules = vec![
            TagRule::region(tags::PATIENT_ID, region(90, 40, 50, 50), None),
            TagRule::region(tags::PATIENT_NAME, region(200, 0, 10, 10), None),
        ];

        let bitmap = bitmap();
        let insertions = enricher
            .enrich(Some(&bitmap), &rules, &RecognitionHint::default())
            .await;

        assert_eq!(insertions.len(), 1);
        assert_eq!(recognizer.seen.lock().unwrap().as_slice(), &[(10, 10)]);
    }

    #[tokio::test]
    async fn test_recognition_failure_is_absorbed() {
        let enricher = TagEnricher::new(
            Arc::new(FixedRecognizer::new(None)),
            Arc::new(FailingDecoder),
        );
        let rules = vec![
            TagRule::region(tags::PATIENT_ID, region(0, 0, 10, 10), None),
            TagRule::value(tags::INSTITUTION_NAME, "Central Hospital"),
        ];

        let image = InMemDicomObject::new_empty();
        let insertions = enricher
            .enrich_image(Some(&image), &rules, &RecognitionHint::default())
            .await;

        assert_eq!(insertions.len(), 1);
        assert_eq!(insertions[0].tag, tags::INSTITUTION_NAME);
    }

    #[test]
    fn test_apply_insertions() {
        let mut dataset = InMemDicomObject::new_empty();
        apply_insertions(
            &mut dataset,
            &[Insertion {
                tag: tags::PATIENT_ID,
                vr: VR::LO,
                value: "12345".into(),
            }],
        );
        assert_eq!(
            dataset.element(tags::PATIENT_ID).unwrap().to_str().unwrap().trim(),
            "12345"
        );
    }
}
