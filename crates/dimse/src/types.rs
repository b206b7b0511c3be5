//! Common types for DIMSE operations

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::error::DimseError;

/// DIMSE status codes used by the services in this workspace
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;
    pub const CANCEL: u16 = 0xFE00;

    pub const COERCION_OF_DATA_ELEMENTS: u16 = 0xB000;
    pub const SUB_OPERATIONS_WARNING: u16 = 0xB000;

    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const NOT_AUTHORIZED: u16 = 0x0124;
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    pub const OUT_OF_RESOURCES_MATCHES: u16 = 0xA701;
    pub const OUT_OF_RESOURCES_SUB_OPERATIONS: u16 = 0xA702;
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    pub const DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    pub const UNABLE_TO_PROCESS: u16 = 0xC001;
}

/// DIMSE-C command field values (0000,0100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        })
    }

    /// The response command paired with a request command
    pub fn response(self) -> Option<Self> {
        match self {
            CommandField::CStoreRq => Some(CommandField::CStoreRsp),
            CommandField::CFindRq => Some(CommandField::CFindRsp),
            CommandField::CMoveRq => Some(CommandField::CMoveRsp),
            CommandField::CEchoRq => Some(CommandField::CEchoRsp),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }
}

impl std::fmt::Display for CommandField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
        };
        f.write_str(name)
    }
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
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

impl DimseStatus {
    /// Wire value for the (0000,0900) Status attribute
    pub fn code(self) -> u16 {
        match self {
            DimseStatus::Success => status::SUCCESS,
            DimseStatus::Pending => status::PENDING,
            DimseStatus::Cancel => status::CANCEL,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => code,
        }
    }

    /// Classify a wire status value (PS3.7 annex C)
    pub fn from_code(code: u16) -> Self {
        match code {
            status::SUCCESS => DimseStatus::Success,
            status::PENDING | status::PENDING_WARNING => DimseStatus::Pending,
            status::CANCEL => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            other => DimseStatus::Failure(other),
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, DimseStatus::Pending)
    }

    /// True for every status that terminates an operation
    pub fn is_final(self) -> bool {
        !self.is_pending()
    }

    pub fn is_failure(self) -> bool {
        matches!(self, DimseStatus::Failure(_))
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Priority of a DIMSE request (0000,0700)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    /// Low priority
    Low,
    /// Medium priority (default)
    Medium,
    /// High priority
    High,
}

impl Priority {
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Priority::High,
            0x0002 => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// One matching or return key of a query identifier
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub tag: Tag,
    pub vr: VR,
    pub value: String,
}

/// Query parameters for C-FIND operations
#[derive(Debug, Clone)]
pub struct FindQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Matching and return keys, in insertion order
    pub keys: Vec<QueryKey>,
}

/// Query parameters for C-MOVE operations
#[derive(Debug, Clone)]
pub struct MoveQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Matching keys
    pub keys: Vec<QueryKey>,

    /// Destination AE Title for the move operation
    pub destination_aet: String,

    /// Priority of the move operation
    pub priority: Priority,
}

fn identifier(level: QueryLevel, keys: &[QueryKey]) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level.to_string()),
    ));
    for key in keys {
        let value = if key.value.is_empty() {
            PrimitiveValue::Empty
        } else {
            PrimitiveValue::from(key.value.as_str())
        };
        obj.put(DataElement::new(key.tag, key.vr, value));
    }
    obj
}

impl FindQuery {
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            keys: Vec::new(),
        }
    }

    /// Create a new patient-level query
    pub fn patient(patient_id: Option<String>) -> Self {
        Self::new(QueryLevel::Patient).with_key(
            tags::PATIENT_ID,
            VR::LO,
            patient_id.unwrap_or_default(),
        )
    }

    /// Create a new study-level query
    pub fn study(study_instance_uid: Option<String>) -> Self {
        Self::new(QueryLevel::Study).with_key(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            study_instance_uid.unwrap_or_default(),
        )
    }

    /// Add a matching key; an empty value requests the attribute as a return key
    pub fn with_key(mut self, tag: Tag, vr: VR, value: impl Into<String>) -> Self {
        self.keys.push(QueryKey {
            tag,
            vr,
            value: value.into(),
        });
        self
    }

    /// Encode as a C-FIND identifier
    pub fn to_identifier(&self) -> InMemDicomObject {
        identifier(self.query_level, &self.keys)
    }
}

impl MoveQuery {
    /// Create a new move query
    pub fn new(query_level: QueryLevel, destination_aet: impl Into<String>) -> Self {
        Self {
            query_level,
            keys: Vec::new(),
            destination_aet: destination_aet.into(),
            priority: Priority::Medium,
        }
    }

    /// Add a matching key
    pub fn with_key(mut self, tag: Tag, vr: VR, value: impl Into<String>) -> Self {
        self.keys.push(QueryKey {
            tag,
            vr,
            value: value.into(),
        });
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Encode as a C-MOVE identifier
    pub fn to_identifier(&self) -> InMemDicomObject {
        identifier(self.query_level, &self.keys)
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(DimseError::DicomParsing(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}
