//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides the DICOM upper layer protocol (PDU codec and
//! association negotiation), DIMSE message assembly, and both Service Class
//! Provider (SCP) and Service Class User (SCU) roles on top of it.
//!
//! # Features
//! - Inbound DIMSE services (SCP): C-ECHO, C-STORE, C-FIND, C-MOVE, C-CANCEL
//! - Outbound DIMSE services (SCU): C-ECHO, C-STORE, C-FIND, C-MOVE
//! - ARTIM and idle timers, bounded association count
//! - Handlers are plugged in per SOP class through [`router::ServiceRegistry`]

pub mod association;
pub mod config;
pub mod error;
pub mod message;
pub mod pdu;
pub mod router;
pub mod scp;
pub mod scu;
pub mod sop_class;
pub mod types;

// Re-export commonly used types
pub use association::{Association, AssociationInfo, PresentationContext};
pub use config::{DimseConfig, PeerRegistry, RemoteNode};
pub use error::{DimseError, Result};
pub use message::{CommandSet, DimseMessage, SubOperations};
pub use router::{
    DimseResponse, EchoHandler, FindHandler, MoveHandler, MoveRequest, PendingResponses,
    RequestContext, ServiceClass, ServiceRegistry, StoreHandler, StoreRequest,
};
pub use scp::DimseScp;
pub use scu::{DimseScu, FindResults, MoveOutcome, ScuAssociation, StoreOutcome};
pub use types::{status, CommandField, DimseStatus, FindQuery, MoveQuery, Priority, QueryLevel};

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
