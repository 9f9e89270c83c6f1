//! Common types for DIMSE operations

use serde::{Deserialize, Serialize};

/// Well-known UIDs used by the print management service classes
pub mod uids {
    /// DICOM Application Context Name
    pub const APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

    /// Verification SOP Class (C-ECHO)
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";

    /// Basic Grayscale Print Management Meta SOP Class
    pub const BASIC_GRAYSCALE_PRINT_META: &str = "1.2.840.10008.5.1.1.9";

    /// Basic Film Session SOP Class
    pub const BASIC_FILM_SESSION: &str = "1.2.840.10008.5.1.1.1";

    /// Basic Film Box SOP Class
    pub const BASIC_FILM_BOX: &str = "1.2.840.10008.5.1.1.2";

    /// Basic Grayscale Image Box SOP Class
    pub const BASIC_GRAYSCALE_IMAGE_BOX: &str = "1.2.840.10008.5.1.1.4";

    /// Printer SOP Class
    pub const PRINTER: &str = "1.2.840.10008.5.1.1.16";

    /// Well-known Printer SOP Instance
    pub const PRINTER_INSTANCE: &str = "1.2.840.10008.5.1.1.17";

    /// Presentation LUT SOP Class
    pub const PRESENTATION_LUT: &str = "1.2.840.10008.5.1.1.23";

    /// Secondary Capture Image Storage, used to wrap image box content
    pub const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

    /// Implicit VR Little Endian
    pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

    /// Explicit VR Little Endian
    pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    /// Explicit VR Big Endian
    pub const EXPLICIT_VR_BE: &str = "1.2.840.10008.1.2.2";

    /// All uncompressed transfer syntaxes, in order of preference
    pub const UNCOMPRESSED_TRANSFER_SYNTAXES: &[&str] =
        &[EXPLICIT_VR_LE, IMPLICIT_VR_LE, EXPLICIT_VR_BE];
}

/// DIMSE command types handled by the print service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimseCommand {
    CEchoRq,
    CEchoRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    NEventReportRq,
    NEventReportRsp,
}

impl DimseCommand {
    /// Command Field (0000,0100) value
    pub fn code(self) -> u16 {
        match self {
            DimseCommand::CEchoRq => 0x0030,
            DimseCommand::CEchoRsp => 0x8030,
            DimseCommand::NGetRq => 0x0110,
            DimseCommand::NGetRsp => 0x8110,
            DimseCommand::NSetRq => 0x0120,
            DimseCommand::NSetRsp => 0x8120,
            DimseCommand::NActionRq => 0x0130,
            DimseCommand::NActionRsp => 0x8130,
            DimseCommand::NCreateRq => 0x0140,
            DimseCommand::NCreateRsp => 0x8140,
            DimseCommand::NDeleteRq => 0x0150,
            DimseCommand::NDeleteRsp => 0x8150,
            DimseCommand::NEventReportRq => 0x0100,
            DimseCommand::NEventReportRsp => 0x8100,
        }
    }

    /// Look up a command by its Command Field value
    pub fn from_code(code: u16) -> Option<Self> {
        let command = match code {
            0x0030 => DimseCommand::CEchoRq,
            0x8030 => DimseCommand::CEchoRsp,
            0x0110 => DimseCommand::NGetRq,
            0x8110 => DimseCommand::NGetRsp,
            0x0120 => DimseCommand::NSetRq,
            0x8120 => DimseCommand::NSetRsp,
            0x0130 => DimseCommand::NActionRq,
            0x8130 => DimseCommand::NActionRsp,
            0x0140 => DimseCommand::NCreateRq,
            0x8140 => DimseCommand::NCreateRsp,
            0x0150 => DimseCommand::NDeleteRq,
            0x8150 => DimseCommand::NDeleteRsp,
            0x0100 => DimseCommand::NEventReportRq,
            0x8100 => DimseCommand::NEventReportRsp,
            _ => return None,
        };
        Some(command)
    }

    /// Whether this is a response command
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// The response matching a request command
    pub fn response(self) -> Self {
        match self {
            DimseCommand::CEchoRq => DimseCommand::CEchoRsp,
            DimseCommand::NGetRq => DimseCommand::NGetRsp,
            DimseCommand::NSetRq => DimseCommand::NSetRsp,
            DimseCommand::NActionRq => DimseCommand::NActionRsp,
            DimseCommand::NCreateRq => DimseCommand::NCreateRsp,
            DimseCommand::NDeleteRq => DimseCommand::NDeleteRsp,
            DimseCommand::NEventReportRq => DimseCommand::NEventReportRsp,
            rsp => rsp,
        }
    }

    /// Whether the SOP class/instance travel in the Requested (rather than
    /// Affected) command attributes of the request
    pub fn uses_requested_uids(self) -> bool {
        matches!(
            self,
            DimseCommand::NGetRq
                | DimseCommand::NSetRq
                | DimseCommand::NActionRq
                | DimseCommand::NDeleteRq
        )
    }
}

impl std::fmt::Display for DimseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DimseCommand::CEchoRq => "C-ECHO-RQ",
            DimseCommand::CEchoRsp => "C-ECHO-RSP",
            DimseCommand::NGetRq => "N-GET-RQ",
            DimseCommand::NGetRsp => "N-GET-RSP",
            DimseCommand::NSetRq => "N-SET-RQ",
            DimseCommand::NSetRsp => "N-SET-RSP",
            DimseCommand::NActionRq => "N-ACTION-RQ",
            DimseCommand::NActionRsp => "N-ACTION-RSP",
            DimseCommand::NCreateRq => "N-CREATE-RQ",
            DimseCommand::NCreateRsp => "N-CREATE-RSP",
            DimseCommand::NDeleteRq => "N-DELETE-RQ",
            DimseCommand::NDeleteRsp => "N-DELETE-RSP",
            DimseCommand::NEventReportRq => "N-EVENT-REPORT-RQ",
            DimseCommand::NEventReportRsp => "N-EVENT-REPORT-RSP",
        };
        f.write_str(name)
    }
}

/// DIMSE status codes used by the print service (DICOM PS3.7 Annex C,
/// PS3.4 Annex H)
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const ATTRIBUTE_LIST_ERROR: u16 = 0x0107;
    pub const NO_SUCH_ATTRIBUTE: u16 = 0x0105;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
    pub const NO_SUCH_SOP_INSTANCE: u16 = 0x0112;
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const FILM_SESSION_EMPTY: u16 = 0xC600;
    pub const UNABLE_TO_CREATE_PRINT_JOB: u16 = 0xC602;
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16),
    /// Warning occurred during operation
    Warning(u16),
}

impl DimseStatus {
    /// Classify a raw Status (0000,0900) value
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    /// Raw status value
    pub fn code(self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => code,
        }
    }

    /// Success or warning
    pub fn is_ok(self) -> bool {
        matches!(self, DimseStatus::Success | DimseStatus::Warning(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(DimseCommand::from_code(0x0140), Some(DimseCommand::NCreateRq));
        assert_eq!(DimseCommand::NCreateRq.response(), DimseCommand::NCreateRsp);
        assert!(DimseCommand::NActionRsp.is_response());
        assert!(!DimseCommand::CEchoRq.is_response());
        assert!(DimseCommand::NSetRq.uses_requested_uids());
        assert!(!DimseCommand::NCreateRq.uses_requested_uids());
        assert_eq!(DimseCommand::from_code(0x0001), None);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(DimseStatus::from_code(0), DimseStatus::Success);
        assert_eq!(DimseStatus::from_code(0xB605), DimseStatus::Warning(0xB605));
        assert_eq!(DimseStatus::from_code(0xC602), DimseStatus::Failure(0xC602));
        assert!(DimseStatus::Warning(0x0107).is_ok());
        assert!(!DimseStatus::Failure(0x0110).is_ok());
    }
}
