//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::DEFAULT_DIMSE_PORT;

/// Configuration for DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    #[serde(default = "default_local_aet")]
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Idle time without peer activity before an association is aborted
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// ARTIM timer: how long to wait for an association request or release reply
    #[serde(default = "default_artim_timeout")]
    pub artim_timeout_ms: u64,

    /// Transfer syntaxes accepted for verification and query/retrieve contexts
    #[serde(default = "default_transfer_syntaxes")]
    pub preferred_transfer_syntaxes: Vec<String>,

    /// Transfer syntaxes accepted for storage SOP classes
    #[serde(default = "default_transfer_syntaxes")]
    pub storage_transfer_syntaxes: Vec<String>,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Maximum number of C-MOVE operations running at the same time
    #[serde(default = "default_max_concurrent_moves")]
    pub max_concurrent_moves: u32,

    /// Accept associations from calling AE titles missing from the registry
    #[serde(default = "default_true")]
    pub accept_unknown_calling_aets: bool,

    /// Enable C-ECHO service
    #[serde(default = "default_true")]
    pub enable_echo: bool,

    /// Enable C-STORE service
    #[serde(default = "default_true")]
    pub enable_store: bool,

    /// Enable C-FIND service
    #[serde(default = "default_true")]
    pub enable_find: bool,

    /// Enable C-MOVE service
    #[serde(default = "default_true")]
    pub enable_move: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// The node may send C-STORE requests to this archive
    #[serde(default = "default_true")]
    pub store: bool,

    /// The node may be named as a C-MOVE destination
    #[serde(default = "default_true")]
    pub move_destination: bool,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

/// Resolves AE titles to network peers
///
/// Consulted when an association is requested and when a C-MOVE names
/// its destination.
pub trait PeerRegistry: Send + Sync {
    fn lookup(&self, ae_title: &str) -> Option<RemoteNode>;
}

impl PeerRegistry for Vec<RemoteNode> {
    fn lookup(&self, ae_title: &str) -> Option<RemoteNode> {
        self.iter().find(|node| node.ae_title == ae_title).cloned()
    }
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: default_local_aet(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            association_timeout_ms: default_association_timeout(),
            artim_timeout_ms: default_artim_timeout(),
            preferred_transfer_syntaxes: default_transfer_syntaxes(),
            storage_transfer_syntaxes: default_transfer_syntaxes(),
            max_associations: default_max_associations(),
            max_concurrent_moves: default_max_concurrent_moves(),
            accept_unknown_calling_aets: true,
            enable_echo: true,
            enable_store: true,
            enable_find: true,
            enable_move: true,
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get association idle timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Get ARTIM timeout as Duration
    pub fn artim_timeout(&self) -> Duration {
        Duration::from_millis(self.artim_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.local_aet)?;

        // Validate PDU size
        if self.max_pdu < 4096 || self.max_pdu > 131072 {
            return Err(DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(DimseError::config("max_associations must be at least 1"));
        }

        if self.max_concurrent_moves == 0 {
            return Err(DimseError::config("max_concurrent_moves must be at least 1"));
        }

        if self.artim_timeout_ms == 0 || self.association_timeout_ms == 0 {
            return Err(DimseError::config("timeouts must be greater than 0"));
        }

        if self.preferred_transfer_syntaxes.is_empty() || self.storage_transfer_syntaxes.is_empty() {
            return Err(DimseError::config(
                "at least one transfer syntax must be configured",
            ));
        }

        Ok(())
    }
}

/// AE titles are 1-16 characters of printable ASCII without backslash
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty()
        || ae_title.len() > 16
        || !ae_title
            .chars()
            .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\')
    {
        return Err(DimseError::InvalidAeTitle(ae_title.to_string()));
    }
    Ok(())
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            store: true,
            move_destination: true,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Restrict what the node may do against this archive
    pub fn with_roles(mut self, store: bool, move_destination: bool) -> Self {
        self.store = store;
        self.move_destination = move_destination;
        self
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }

    /// Parses a `AET@host:port;AET@host:port` list, ignoring empty segments
    pub fn parse_list(list: &str) -> Result<Vec<RemoteNode>> {
        list.split(';')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for RemoteNode {
    type Err = DimseError;

    /// Parses the `AET@host:port` connection string form
    fn from_str(s: &str) -> Result<Self> {
        let (ae_title, address) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| DimseError::config(format!("expected AET@host:port, got '{}'", s)))?;
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| DimseError::config(format!("missing port in '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DimseError::config(format!("invalid port in '{}'", s)))?;
        let node = RemoteNode::new(ae_title, host, port);
        node.validate()?;
        Ok(node)
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

// Default value functions
fn default_local_aet() -> String {
    "MUPACS".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_association_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_artim_timeout() -> u64 {
    30_000
}

fn default_transfer_syntaxes() -> Vec<String> {
    crate::sop_class::uncompressed_transfer_syntaxes()
}

fn default_max_associations() -> u32 {
    10
}

fn default_max_concurrent_moves() -> u32 {
    2
}

fn default_true() -> bool {
    true
}
