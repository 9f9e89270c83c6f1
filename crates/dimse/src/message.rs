//! DIMSE messages and their command set codec
//!
//! Command sets are always encoded in Implicit VR Little Endian; datasets
//! travel in the transfer syntax negotiated for the presentation context.

use dicom_core::value::Value;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType};

use crate::types::{DimseCommand, DimseStatus};
use crate::{DimseError, Result};

/// Command Data Set Type value meaning "no dataset follows"
const NO_DATASET: u16 = 0x0101;

/// Command Data Set Type value used when a dataset follows
const DATASET_PRESENT: u16 = 0x0000;

/// A single DIMSE request or response
#[derive(Debug, Clone)]
pub struct DimseMessage {
    /// Presentation context the message travels on
    pub presentation_context_id: u8,

    /// Command Field
    pub command: DimseCommand,

    /// Message ID for requests, Message ID Being Responded To for responses
    pub message_id: u16,

    /// Affected or Requested SOP Class UID
    pub sop_class_uid: String,

    /// Affected or Requested SOP Instance UID
    pub sop_instance_uid: Option<String>,

    /// Action Type ID (N-ACTION only)
    pub action_type_id: Option<u16>,

    /// Attribute Identifier List (N-GET only)
    pub attribute_identifiers: Vec<Tag>,

    /// Status (responses only)
    pub status: Option<u16>,

    /// Error Comment (failed responses only)
    pub error_comment: Option<String>,

    /// Dataset following the command set, if any
    pub dataset: Option<InMemDicomObject>,
}

impl DimseMessage {
    /// Create a request without dataset
    pub fn request(
        command: DimseCommand,
        message_id: u16,
        sop_class_uid: impl Into<String>,
        sop_instance_uid: Option<String>,
    ) -> Self {
        Self {
            presentation_context_id: 0,
            command,
            message_id,
            sop_class_uid: sop_class_uid.into(),
            sop_instance_uid,
            action_type_id: None,
            attribute_identifiers: Vec::new(),
            status: None,
            error_comment: None,
            dataset: None,
        }
    }

    /// Build the response to this request, echoing its identifiers
    pub fn response(&self, status: u16) -> Self {
        Self {
            presentation_context_id: self.presentation_context_id,
            command: self.command.response(),
            message_id: self.message_id,
            sop_class_uid: self.sop_class_uid.clone(),
            sop_instance_uid: self.sop_instance_uid.clone(),
            action_type_id: self.action_type_id,
            attribute_identifiers: Vec::new(),
            status: Some(status),
            error_comment: None,
            dataset: None,
        }
    }

    /// Attach a dataset
    pub fn with_dataset(mut self, dataset: InMemDicomObject) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Set the presentation context
    pub fn on_context(mut self, presentation_context_id: u8) -> Self {
        self.presentation_context_id = presentation_context_id;
        self
    }

    /// Set the Action Type ID
    pub fn with_action_type(mut self, action_type_id: u16) -> Self {
        self.action_type_id = Some(action_type_id);
        self
    }

    /// Set the Attribute Identifier List
    pub fn with_attribute_identifiers(mut self, attributes: Vec<Tag>) -> Self {
        self.attribute_identifiers = attributes;
        self
    }

    /// Set the SOP instance UID (N-CREATE responses carry the allocated one)
    pub fn with_instance(mut self, sop_instance_uid: impl Into<String>) -> Self {
        self.sop_instance_uid = Some(sop_instance_uid.into());
        self
    }

    /// Set the Error Comment
    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        let mut comment: String = comment.into();
        // LO is limited to 64 characters
        if let Some((end, _)) = comment.char_indices().nth(64) {
            comment.truncate(end);
        }
        self.error_comment = Some(comment);
        self
    }

    /// Classified status of a response
    pub fn dimse_status(&self) -> Option<DimseStatus> {
        self.status.map(DimseStatus::from_code)
    }

    /// Build the command set object for this message
    pub fn to_command_object(&self) -> InMemDicomObject {
        let is_request = !self.command.is_response();
        let requested = is_request && self.command.uses_requested_uids();

        let (class_tag, instance_tag) = if requested {
            (tags::REQUESTED_SOP_CLASS_UID, tags::REQUESTED_SOP_INSTANCE_UID)
        } else {
            (tags::AFFECTED_SOP_CLASS_UID, tags::AFFECTED_SOP_INSTANCE_UID)
        };
        let id_tag = if is_request {
            tags::MESSAGE_ID
        } else {
            tags::MESSAGE_ID_BEING_RESPONDED_TO
        };
        let data_set_type = if self.dataset.is_some() {
            DATASET_PRESENT
        } else {
            NO_DATASET
        };

        let mut elements = vec![
            DataElement::new(
                class_tag,
                VR::UI,
                PrimitiveValue::from(self.sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                PrimitiveValue::from(self.command.code()),
            ),
            DataElement::new(id_tag, VR::US, PrimitiveValue::from(self.message_id)),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                PrimitiveValue::from(data_set_type),
            ),
        ];

        if let Some(status) = self.status {
            elements.push(DataElement::new(
                tags::STATUS,
                VR::US,
                PrimitiveValue::from(status),
            ));
        }
        if let Some(instance) = &self.sop_instance_uid {
            elements.push(DataElement::new(
                instance_tag,
                VR::UI,
                PrimitiveValue::from(instance.as_str()),
            ));
        }
        if let Some(action_type_id) = self.action_type_id {
            elements.push(DataElement::new(
                tags::ACTION_TYPE_ID,
                VR::US,
                PrimitiveValue::from(action_type_id),
            ));
        }
        if !self.attribute_identifiers.is_empty() {
            elements.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(self.attribute_identifiers.iter().copied().collect()),
            ));
        }
        if let Some(comment) = &self.error_comment {
            elements.push(DataElement::new(
                tags::ERROR_COMMENT,
                VR::LO,
                PrimitiveValue::from(comment.as_str()),
            ));
        }

        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Read a message (without its dataset) from a command set object.
    ///
    /// Returns the message and whether a dataset follows.
    pub fn from_command_object(
        obj: &InMemDicomObject,
        presentation_context_id: u8,
    ) -> Result<(Self, bool)> {
        let code = obj
            .element(tags::COMMAND_FIELD)
            .map_err(|_| DimseError::parsing("Missing Command Field"))?
            .uint16()
            .map_err(|_| DimseError::parsing("Command Field is not an integer"))?;
        let command = DimseCommand::from_code(code)
            .ok_or_else(|| DimseError::parsing(format!("Unsupported command {:#06x}", code)))?;

        let id_tag = if command.is_response() {
            tags::MESSAGE_ID_BEING_RESPONDED_TO
        } else {
            tags::MESSAGE_ID
        };
        let message_id = obj
            .element(id_tag)
            .map_err(|_| DimseError::parsing("Missing Message ID"))?
            .to_int::<u16>()
            .map_err(|_| DimseError::parsing("Message ID is not an integer"))?;

        let sop_class_uid = uid_value(obj, tags::AFFECTED_SOP_CLASS_UID)
            .or_else(|| uid_value(obj, tags::REQUESTED_SOP_CLASS_UID))
            .unwrap_or_default();
        let sop_instance_uid = uid_value(obj, tags::AFFECTED_SOP_INSTANCE_UID)
            .or_else(|| uid_value(obj, tags::REQUESTED_SOP_INSTANCE_UID));

        let has_dataset = obj
            .element(tags::COMMAND_DATA_SET_TYPE)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            .map(|v| v != NO_DATASET)
            .unwrap_or(false);

        let status = obj
            .element(tags::STATUS)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok());
        let action_type_id = obj
            .element(tags::ACTION_TYPE_ID)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok());
        let error_comment = obj
            .element(tags::ERROR_COMMENT)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string());

        let attribute_identifiers = match obj.element(tags::ATTRIBUTE_IDENTIFIER_LIST) {
            Ok(e) => match e.value() {
                Value::Primitive(PrimitiveValue::Tags(list)) => list.iter().copied().collect(),
                _ => Vec::new(),
            },
            Err(_) => Vec::new(),
        };

        let message = Self {
            presentation_context_id,
            command,
            message_id,
            sop_class_uid,
            sop_instance_uid,
            action_type_id,
            attribute_identifiers,
            status,
            error_comment,
            dataset: None,
        };
        Ok((message, has_dataset))
    }

    /// Encode the command set
    pub fn encode_command(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        self.to_command_object()
            .write_dataset_with_ts(&mut buf, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| DimseError::encoding(format!("could not write command set: {}", e)))?;
        Ok(buf)
    }

    /// Split the message into P-DATA values, fragmenting the dataset so that
    /// no value exceeds `max_fragment` bytes.
    pub fn to_pdata_values(&self, transfer_syntax: &str, max_fragment: usize) -> Result<Vec<PDataValue>> {
        let mut values = vec![PDataValue {
            presentation_context_id: self.presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: self.encode_command()?,
        }];

        if let Some(dataset) = &self.dataset {
            let data = encode_dataset(dataset, transfer_syntax)?;
            let chunk = max_fragment.max(1);
            let mut chunks = data.chunks(chunk).peekable();
            if chunks.peek().is_none() {
                values.push(PDataValue {
                    presentation_context_id: self.presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: Vec::new(),
                });
            }
            while let Some(part) = chunks.next() {
                values.push(PDataValue {
                    presentation_context_id: self.presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last: chunks.peek().is_none(),
                    data: part.to_vec(),
                });
            }
        }

        Ok(values)
    }
}

/// Encode a dataset in the given transfer syntax
pub fn encode_dataset(dataset: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .ok_or_else(|| DimseError::encoding(format!("Unknown transfer syntax {}", transfer_syntax)))?;
    let mut buf = Vec::with_capacity(2048);
    dataset
        .write_dataset_with_ts(&mut buf, ts)
        .map_err(|e| DimseError::encoding(format!("could not write dataset: {}", e)))?;
    Ok(buf)
}

/// Decode a dataset in the given transfer syntax
pub fn decode_dataset(data: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .ok_or_else(|| DimseError::parsing(format!("Unknown transfer syntax {}", transfer_syntax)))?;
    InMemDicomObject::read_dataset_with_ts(data, ts)
        .map_err(|e| DimseError::parsing(format!("failed to read DICOM data object: {}", e)))
}

/// Read a UID attribute, stripping the trailing padding
fn uid_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
        .filter(|s| !s.is_empty())
}

/// A message whose command set has been decoded and whose dataset bytes,
/// if any, have been fully received
#[derive(Debug)]
pub struct AssembledMessage {
    pub message: DimseMessage,
    pub data: Option<Vec<u8>>,
}

impl AssembledMessage {
    /// Decode the dataset in the transfer syntax of the presentation context
    pub fn into_message(self, transfer_syntax: &str) -> Result<DimseMessage> {
        let mut message = self.message;
        if let Some(data) = self.data {
            message.dataset = Some(decode_dataset(&data, transfer_syntax)?);
        }
        Ok(message)
    }
}

/// Reassembles P-DATA fragments into complete messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command_buffer: Vec<u8>,
    data_buffer: Vec<u8>,
    pending: Option<DimseMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one P-DATA value; returns a message once it is complete
    pub fn push(&mut self, value: PDataValue) -> Result<Option<AssembledMessage>> {
        let PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            mut data,
        } = value;

        if value_type == PDataValueType::Command {
            if self.pending.is_some() {
                return Err(DimseError::parsing(
                    "command fragment received while awaiting dataset",
                ));
            }
            self.command_buffer.append(&mut data);
            if !is_last {
                return Ok(None);
            }

            let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
            let obj = InMemDicomObject::read_dataset_with_ts(self.command_buffer.as_slice(), &ts)
                .map_err(|e| DimseError::parsing(format!("failed to read incoming DICOM command: {}", e)))?;
            self.command_buffer.clear();

            let (message, has_dataset) =
                DimseMessage::from_command_object(&obj, presentation_context_id)?;
            if has_dataset {
                self.pending = Some(message);
                Ok(None)
            } else {
                Ok(Some(AssembledMessage { message, data: None }))
            }
        } else {
            if self.pending.is_none() {
                return Err(DimseError::parsing("dataset fragment received before command"));
            }
            self.data_buffer.append(&mut data);
            if !is_last {
                return Ok(None);
            }
            let message = self
                .pending
                .take()
                .ok_or_else(|| DimseError::parsing("dataset without command"))?;
            let data = std::mem::take(&mut self.data_buffer);
            Ok(Some(AssembledMessage {
                message,
                data: Some(data),
            }))
        }
    }

    /// Whether part of a message has been received
    pub fn is_partial(&self) -> bool {
        self.pending.is_some() || !self.command_buffer.is_empty()
    }
}
