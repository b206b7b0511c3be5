//! SOP Class and transfer syntax UIDs negotiated by this implementation

use dicom_dictionary_std::uids;

pub const VERIFICATION: &str = "1.2.840.10008.1.1";

pub const PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
pub const PATIENT_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Storage SOP classes accepted by default
pub const STORAGE: &[&str] = &[
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    "1.2.840.10008.5.1.4.1.1.6.1", // Ultrasound Image Storage
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
    "1.2.840.10008.5.1.4.1.1.12.1", // X-Ray Angiographic Image Storage
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
];

/// Uncompressed transfer syntaxes every service accepts
pub fn uncompressed_transfer_syntaxes() -> Vec<String> {
    vec![
        EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        EXPLICIT_VR_BIG_ENDIAN.to_string(),
    ]
}

/// Query/Retrieve information model behind a Find or Move SOP class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationModel {
    PatientRoot,
    StudyRoot,
}

impl InformationModel {
    pub fn from_sop_class(uid: &str) -> Option<Self> {
        match uid {
            PATIENT_ROOT_FIND | PATIENT_ROOT_MOVE => Some(InformationModel::PatientRoot),
            STUDY_ROOT_FIND | STUDY_ROOT_MOVE => Some(InformationModel::StudyRoot),
            _ => None,
        }
    }
}
