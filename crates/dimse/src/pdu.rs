//! Upper layer PDU framing on top of `dicom_ul::pdu`
//!
//! [`PduCodec`] plugs the `dicom-ul` reader and writer into
//! `tokio_util::codec::Framed` so an association reads and writes whole
//! PDUs. The A-ASSOCIATE-RJ content is lifted into [`RejectReason`], which
//! is what callers match on.

use std::fmt;
use std::io::Cursor;

use bytes::BytesMut;
use dicom_ul::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason, AssociationRJSource,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DimseError, Result};

pub use dicom_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem,
};

/// DICOM application context name, the only one this implementation speaks
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Upper layer protocol version
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Length of the fixed PDU header
pub const PDU_HEADER_LENGTH: usize = 6;

/// Bytes a P-DATA-TF PDU spends on a single PDV item header
/// (4 length bytes, the context ID and the message control header)
pub const PDV_HEADER_LENGTH: u32 = 6;

/// Upper bound for non P-DATA PDUs, which carry negotiation data only
const MAX_CONTROL_PDU_LENGTH: u32 = 1024 * 1024;

const P_DATA_TF: u8 = 0x04;

/// Short name used in logs and protocol errors
pub fn pdu_name(pdu: &Pdu) -> String {
    match pdu {
        Pdu::AssociationRQ(_) => "A-ASSOCIATE-RQ".to_string(),
        Pdu::AssociationAC(_) => "A-ASSOCIATE-AC".to_string(),
        Pdu::AssociationRJ(_) => "A-ASSOCIATE-RJ".to_string(),
        Pdu::PData { .. } => "P-DATA-TF".to_string(),
        Pdu::ReleaseRQ => "A-RELEASE-RQ".to_string(),
        Pdu::ReleaseRP => "A-RELEASE-RP".to_string(),
        Pdu::AbortRQ { .. } => "A-ABORT".to_string(),
        Pdu::Unknown { pdu_type, .. } => format!("PDU type 0x{:02X}", pdu_type),
    }
}

/// A-ABORT issued by this node as service provider
pub fn provider_abort(reason: AbortRQServiceProviderReason) -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(reason),
    }
}

/// A-ABORT issued by this node as service user
pub fn user_abort() -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectResult {
    Permanent,
    Transient,
}

/// Why an association request was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCause {
    NoReasonGiven,
    ApplicationContextNotSupported,
    CallingAeNotRecognized,
    CalledAeNotRecognized,
    ProtocolVersionNotSupported,
    TemporaryCongestion,
    LocalLimitExceeded,
}

/// Content of an A-ASSOCIATE-RJ PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectReason {
    pub result: RejectResult,
    pub cause: RejectCause,
}

impl RejectReason {
    pub fn permanent(cause: RejectCause) -> Self {
        Self {
            result: RejectResult::Permanent,
            cause,
        }
    }

    pub fn transient(cause: RejectCause) -> Self {
        Self {
            result: RejectResult::Transient,
            cause,
        }
    }
}

impl From<&AssociationRJ> for RejectReason {
    fn from(rj: &AssociationRJ) -> Self {
        let result = match rj.result {
            AssociationRJResult::Transient => RejectResult::Transient,
            _ => RejectResult::Permanent,
        };
        let cause = match &rj.source {
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::ApplicationContextNameNotSupported) => {
                RejectCause::ApplicationContextNotSupported
            }
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CallingAETitleNotRecognized) => {
                RejectCause::CallingAeNotRecognized
            }
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CalledAETitleNotRecognized) => {
                RejectCause::CalledAeNotRecognized
            }
            AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ) => RejectCause::ProtocolVersionNotSupported,
            AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ) => RejectCause::TemporaryCongestion,
            AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ) => RejectCause::LocalLimitExceeded,
            _ => RejectCause::NoReasonGiven,
        };
        Self { result, cause }
    }
}

impl From<RejectReason> for AssociationRJ {
    fn from(reason: RejectReason) -> Self {
        let result = match reason.result {
            RejectResult::Permanent => AssociationRJResult::Permanent,
            RejectResult::Transient => AssociationRJResult::Transient,
        };
        let source = match reason.cause {
            RejectCause::NoReasonGiven => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
            }
            RejectCause::ApplicationContextNotSupported => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
            RejectCause::CallingAeNotRecognized => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
            RejectCause::CalledAeNotRecognized => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
            RejectCause::ProtocolVersionNotSupported => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
            RejectCause::TemporaryCongestion => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            RejectCause::LocalLimitExceeded => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
        };
        AssociationRJ { result, source }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self.result {
            RejectResult::Permanent => "permanent",
            RejectResult::Transient => "transient",
        };
        let cause = match self.cause {
            RejectCause::NoReasonGiven => "no-reason-given",
            RejectCause::ApplicationContextNotSupported => "application-context-name-not-supported",
            RejectCause::CallingAeNotRecognized => "calling-AE-title-not-recognized",
            RejectCause::CalledAeNotRecognized => "called-AE-title-not-recognized",
            RejectCause::ProtocolVersionNotSupported => "protocol-version-not-supported",
            RejectCause::TemporaryCongestion => "temporary-congestion",
            RejectCause::LocalLimitExceeded => "local-limit-exceeded",
        };
        write!(f, "{} ({})", cause, result)
    }
}

/// Frames upper layer PDUs over a byte stream
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_pdu_length: u32,
}

impl PduCodec {
    /// `max_pdu_length` bounds inbound P-DATA-TF PDUs; 0 means unlimited
    pub fn new(max_pdu_length: u32) -> Self {
        Self { max_pdu_length }
    }

    fn limit_for(&self, pdu_type: u8) -> u32 {
        if pdu_type == P_DATA_TF && self.max_pdu_length > 0 {
            // peers may count the PDV item headers on top of the negotiated length
            self.max_pdu_length.saturating_add(PDV_HEADER_LENGTH)
        } else {
            MAX_CONTROL_PDU_LENGTH.max(self.max_pdu_length)
        }
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = DimseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pdu>> {
        if src.len() < PDU_HEADER_LENGTH {
            return Ok(None);
        }

        let pdu_type = src[0];
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
        let limit = self.limit_for(pdu_type);
        if length > limit {
            return Err(DimseError::malformed(format!(
                "PDU type 0x{:02X} declares {} bytes, limit is {}",
                pdu_type, length, limit
            )));
        }

        let total = PDU_HEADER_LENGTH + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let mut cursor = Cursor::new(&frame[..]);
        let pdu = dicom_ul::read_pdu(&mut cursor, limit, false)
            .map_err(|e| DimseError::malformed(e.to_string()))?
            .ok_or_else(|| DimseError::malformed(format!("truncated PDU type 0x{:02X}", pdu_type)))?;

        match pdu {
            Pdu::Unknown { pdu_type, .. } => Err(DimseError::malformed(format!(
                "unknown PDU type 0x{:02X}",
                pdu_type
            ))),
            pdu => Ok(Some(pdu)),
        }
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = DimseError;

    fn encode(&mut self, pdu: Pdu, dst: &mut BytesMut) -> Result<()> {
        let mut buf = Vec::new();
        dicom_ul::write_pdu(&mut buf, &pdu)
            .map_err(|e| DimseError::internal(format!("cannot encode {}: {}", pdu_name(&pdu), e)))?;
        dst.extend_from_slice(&buf);
        Ok(())
    }
}
