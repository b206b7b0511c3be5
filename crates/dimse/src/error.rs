//! Error types for DIMSE operations

use thiserror::Error;

use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, RejectReason};

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("Unexpected PDU: {0}")]
    UnexpectedPdu(String),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM encoding error: {0}")]
    DicomEncoding(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(RejectReason),

    #[error("Association aborted: {0:?}")]
    Aborted(AbortRQSource),

    #[error("Association closed by peer")]
    ConnectionClosed,

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("No accepted presentation context for {0}")]
    NoPresentationContext(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new malformed PDU error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPdu(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_) | DimseError::Timeout(_) | DimseError::AssociationRejected(_)
        )
    }

    /// A-ABORT reason code a service provider sends when this error ends an association
    pub fn abort_reason(&self) -> AbortRQServiceProviderReason {
        match self {
            DimseError::MalformedPdu(_) => AbortRQServiceProviderReason::UnrecognizedPdu,
            DimseError::UnexpectedPdu(_) => AbortRQServiceProviderReason::UnexpectedPdu,
            DimseError::DicomParsing(_) => AbortRQServiceProviderReason::InvalidPduParameter,
            _ => AbortRQServiceProviderReason::ReasonNotSpecified,
        }
    }
}
