//! Print engine error kinds and their DIMSE status mapping

use dicom_core::Tag;
use dimse::types::status;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PrintError>;

/// A failed print management operation.
///
/// These never cross the association boundary: the engine turns each one
/// into a response carrying [`PrintError::status`] and the error text as
/// Error Comment, and the association stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrintError {
    /// Operation not valid in the current job state
    #[error("{0}")]
    ProtocolViolation(String),

    #[error("No such SOP class: {0}")]
    NoSuchSopClass(String),

    #[error("Unsupported operation {0}")]
    UnrecognizedOperation(String),

    #[error("No such SOP instance: {0}")]
    NoSuchInstance(String),

    #[error("Duplicate SOP instance: {0}")]
    DuplicateInstance(String),

    #[error("Attribute {0} not supported")]
    NoSuchAttribute(Tag),

    #[error("Invalid attribute value: {0}")]
    InvalidAttributeValue(String),

    /// Print requested for a film box with no image content
    #[error("{0}")]
    EmptyPage(String),

    /// Upstream printer failed and the printer tolerates no upstream errors
    #[error("Upstream printer failed: {0}")]
    Upstream(String),
}

impl PrintError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn no_such_instance(uid: impl Into<String>) -> Self {
        Self::NoSuchInstance(uid.into())
    }

    /// DIMSE status reported to the client
    pub fn status(&self) -> u16 {
        match self {
            PrintError::ProtocolViolation(_) => status::PROCESSING_FAILURE,
            PrintError::NoSuchSopClass(_) => status::NO_SUCH_SOP_CLASS,
            PrintError::UnrecognizedOperation(_) => status::UNRECOGNIZED_OPERATION,
            PrintError::NoSuchInstance(_) => status::NO_SUCH_SOP_INSTANCE,
            PrintError::DuplicateInstance(_) => status::DUPLICATE_SOP_INSTANCE,
            PrintError::NoSuchAttribute(_) => status::NO_SUCH_ATTRIBUTE,
            PrintError::InvalidAttributeValue(_) => status::INVALID_ATTRIBUTE_VALUE,
            PrintError::EmptyPage(_) => status::FILM_SESSION_EMPTY,
            PrintError::Upstream(_) => status::UNABLE_TO_CREATE_PRINT_JOB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(PrintError::protocol("set before create").status(), 0x0110);
        assert_eq!(PrintError::no_such_instance("1.2.3").status(), 0x0112);
        assert_eq!(PrintError::NoSuchAttribute(Tag(0x2010, 0x9999)).status(), 0x0105);
        assert_eq!(PrintError::EmptyPage("no images".into()).status(), 0xC600);
        assert_eq!(PrintError::Upstream("refused".into()).status(), 0xC602);
    }

    #[test]
    fn test_display() {
        let err = PrintError::NoSuchAttribute(Tag(0x2010, 0x9999));
        assert_eq!(err.to_string(), "Attribute (2010,9999) not supported");
    }
}
