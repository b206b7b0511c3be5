//! Upper layer association state machine
//!
//! An [`Association`] is created either by [`accept`] on an inbound TCP
//! stream or by [`request`] towards a remote node. Both paths end in the
//! `Established` state with a negotiated set of presentation contexts, or
//! in an error after the A-ASSOCIATE-RJ / A-ABORT has been written. Once
//! established the connection is split into an [`AssociationReader`] and an
//! [`AssociationWriter`] so that a provider can keep reading (for
//! C-CANCEL, release or abort) while responses are still being written.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::{PeerRegistry, RemoteNode};
use crate::error::{DimseError, Result};
use crate::message::{DimseMessage, MessageAssembler};
use crate::pdu::{
    pdu_name, provider_abort, user_abort, AbortRQServiceProviderReason, AbortRQSource,
    AssociationAC, AssociationRQ, Pdu, PduCodec, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, RejectCause, RejectReason,
    UserVariableItem, APPLICATION_CONTEXT_NAME, PDV_HEADER_LENGTH, PROTOCOL_VERSION,
};

/// Implementation Class UID sent in every A-ASSOCIATE PDU
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.274318470392187219937312620563447012891";

/// Implementation Version Name sent in every A-ASSOCIATE PDU
pub const IMPLEMENTATION_VERSION_NAME: &str = "MUPACS_010";

/// Fragment size used when the peer does not limit its PDU length
const UNLIMITED_PEER_FRAGMENT: usize = 64 * 1024;

type PduSink = SplitSink<Framed<TcpStream, PduCodec>, Pdu>;
type PduStream = SplitStream<Framed<TcpStream, PduCodec>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    Requested,
    Established,
    Releasing,
    Aborted,
    Closed,
}

/// Which side opened the association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRole {
    Requestor,
    Acceptor,
}

/// A presentation context accepted during negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// Parameters fixed at negotiation time
#[derive(Debug, Clone)]
pub struct AssociationInfo {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub peer_addr: SocketAddr,
    /// Largest P-DATA-TF the peer accepts, 0 for unlimited
    pub peer_max_pdu: u32,
    pub local_max_pdu: u32,
    pub presentation_contexts: Vec<PresentationContext>,
    pub peer_implementation_class_uid: Option<String>,
}

impl AssociationInfo {
    pub fn context(&self, id: u8) -> Option<&PresentationContext> {
        self.presentation_contexts.iter().find(|pc| pc.id == id)
    }

    /// First accepted context for an abstract syntax
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
    }

    /// Largest PDV payload that fits in one P-DATA-TF for the peer
    pub fn max_fragment(&self) -> usize {
        if self.peer_max_pdu == 0 {
            UNLIMITED_PEER_FRAGMENT
        } else {
            self.peer_max_pdu.saturating_sub(PDV_HEADER_LENGTH).max(1) as usize
        }
    }
}

/// Local acceptance policy for inbound associations
#[derive(Clone)]
pub struct AcceptorOptions {
    pub ae_title: String,
    pub max_pdu: u32,
    /// Abstract syntax -> transfer syntaxes accepted for it
    pub supported: HashMap<String, Vec<String>>,
    pub accept_unknown_calling_aets: bool,
    pub peers: Arc<dyn PeerRegistry>,
    pub artim_timeout: Duration,
}

/// Parameters for an outbound association
#[derive(Debug, Clone)]
pub struct RequestorOptions {
    pub calling_ae_title: String,
    pub max_pdu: u32,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub connect_timeout: Duration,
    pub artim_timeout: Duration,
}

impl RequestorOptions {
    /// Proposes each abstract syntax with the given transfer syntaxes, using odd context IDs
    pub fn propose(
        calling_ae_title: impl Into<String>,
        abstract_syntaxes: &[(String, Vec<String>)],
    ) -> Result<Self> {
        if abstract_syntaxes.len() > 128 {
            return Err(DimseError::config(
                "at most 128 presentation contexts can be proposed",
            ));
        }
        let presentation_contexts = abstract_syntaxes
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (i * 2 + 1) as u8,
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntaxes: transfer_syntaxes.clone(),
            })
            .collect();
        Ok(Self {
            calling_ae_title: calling_ae_title.into(),
            max_pdu: 16384,
            presentation_contexts,
            connect_timeout: Duration::from_secs(30),
            artim_timeout: Duration::from_secs(30),
        })
    }
}

/// Outcome of evaluating an A-ASSOCIATE-RQ against the local policy
pub fn negotiate(
    rq: &AssociationRQ,
    options: &AcceptorOptions,
) -> std::result::Result<Vec<PresentationContextResult>, RejectReason> {
    if rq.protocol_version & PROTOCOL_VERSION == 0 {
        return Err(RejectReason::permanent(
            RejectCause::ProtocolVersionNotSupported,
        ));
    }
    if rq.application_context_name != APPLICATION_CONTEXT_NAME {
        return Err(RejectReason::permanent(
            RejectCause::ApplicationContextNotSupported,
        ));
    }
    if rq.called_ae_title != options.ae_title {
        return Err(RejectReason::permanent(RejectCause::CalledAeNotRecognized));
    }
    if !options.accept_unknown_calling_aets
        && options.peers.lookup(&rq.calling_ae_title).is_none()
    {
        return Err(RejectReason::permanent(RejectCause::CallingAeNotRecognized));
    }

    let results: Vec<PresentationContextResult> = rq
        .presentation_contexts
        .iter()
        .map(|pc| match options.supported.get(&pc.abstract_syntax) {
            None => PresentationContextResult {
                id: pc.id,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: pc.transfer_syntaxes.first().cloned().unwrap_or_default(),
            },
            Some(accepted) => match pc
                .transfer_syntaxes
                .iter()
                .find(|ts| accepted.iter().any(|a| a == *ts))
            {
                Some(ts) => PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: ts.clone(),
                },
                None => PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: pc.transfer_syntaxes.first().cloned().unwrap_or_default(),
                },
            },
        })
        .collect();

    if !results
        .iter()
        .any(|r| r.reason == PresentationContextResultReason::Acceptance)
    {
        return Err(RejectReason::permanent(RejectCause::NoReasonGiven));
    }
    Ok(results)
}

fn peer_max_length(variables: &[UserVariableItem]) -> u32 {
    variables
        .iter()
        .find_map(|v| match v {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(0)
}

fn implementation_class(variables: &[UserVariableItem]) -> Option<String> {
    variables.iter().find_map(|v| match v {
        UserVariableItem::ImplementationClassUID(uid) => Some(uid.clone()),
        _ => None,
    })
}

fn local_user_variables(max_pdu: u32) -> Vec<UserVariableItem> {
    vec![
        UserVariableItem::MaxLength(max_pdu),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ]
}

/// Runs the acceptor side of association establishment on a fresh connection
///
/// With `over_limit` set the request is read and then rejected transiently,
/// so the peer learns why instead of seeing a dropped connection.
pub async fn accept(
    stream: TcpStream,
    options: &AcceptorOptions,
    over_limit: bool,
) -> Result<Association> {
    let peer_addr = stream.peer_addr()?;
    let mut framed = Framed::new(stream, PduCodec::new(options.max_pdu));

    let first = match timeout(options.artim_timeout, framed.next()).await {
        Err(_) => {
            return Err(DimseError::Timeout(
                "no A-ASSOCIATE-RQ before ARTIM expiry".to_string(),
            ))
        }
        Ok(None) => return Err(DimseError::ConnectionClosed),
        Ok(Some(Err(e))) => {
            let _ = framed.send(provider_abort(e.abort_reason())).await;
            return Err(e);
        }
        Ok(Some(Ok(pdu))) => pdu,
    };

    let rq = match first {
        Pdu::AssociationRQ(rq) => rq,
        other => {
            let _ = framed
                .send(provider_abort(AbortRQServiceProviderReason::UnexpectedPdu))
                .await;
            return Err(DimseError::UnexpectedPdu(pdu_name(&other)));
        }
    };
    debug!(
        state = ?AssociationState::Requested,
        calling = %rq.calling_ae_title,
        "received A-ASSOCIATE-RQ"
    );

    let negotiated = if over_limit {
        Err(RejectReason::transient(RejectCause::LocalLimitExceeded))
    } else {
        negotiate(&rq, options)
    };

    let results = match negotiated {
        Ok(results) => results,
        Err(reason) => {
            info!(
                peer = %peer_addr,
                calling_ae = %rq.calling_ae_title,
                called_ae = %rq.called_ae_title,
                "rejecting association: {}",
                reason
            );
            framed.send(Pdu::AssociationRJ(reason.into())).await?;
            return Err(DimseError::AssociationRejected(reason));
        }
    };

    let presentation_contexts = accepted_contexts(&rq.presentation_contexts, &results);
    let ac = AssociationAC {
        protocol_version: PROTOCOL_VERSION,
        called_ae_title: rq.called_ae_title.clone(),
        calling_ae_title: rq.calling_ae_title.clone(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: results,
        user_variables: local_user_variables(options.max_pdu),
    };
    framed.send(Pdu::AssociationAC(ac)).await?;

    let info = AssociationInfo {
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        peer_addr,
        peer_max_pdu: peer_max_length(&rq.user_variables),
        local_max_pdu: options.max_pdu,
        presentation_contexts,
        peer_implementation_class_uid: implementation_class(&rq.user_variables),
    };
    debug!(contexts = info.presentation_contexts.len(), "association established");

    Ok(Association::new(
        framed,
        info,
        options.artim_timeout,
        AssociationRole::Acceptor,
    ))
}

fn accepted_contexts(
    proposed: &[PresentationContextProposed],
    results: &[PresentationContextResult],
) -> Vec<PresentationContext> {
    results
        .iter()
        .filter(|r| r.reason == PresentationContextResultReason::Acceptance)
        .filter_map(|r| {
            proposed
                .iter()
                .find(|p| p.id == r.id)
                .map(|p| PresentationContext {
                    id: r.id,
                    abstract_syntax: p.abstract_syntax.clone(),
                    transfer_syntax: r.transfer_syntax.clone(),
                })
        })
        .collect()
}

/// Opens an association with a remote node as the requestor
pub async fn request(node: &RemoteNode, options: &RequestorOptions) -> Result<Association> {
    let connect_timeout = node
        .connect_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(options.connect_timeout);
    let stream = timeout(connect_timeout, TcpStream::connect(node.address()))
        .await
        .map_err(|_| DimseError::Timeout(format!("connecting to {}", node)))??;
    let peer_addr = stream.peer_addr()?;
    let max_pdu = node.max_pdu.unwrap_or(options.max_pdu);
    let mut framed = Framed::new(stream, PduCodec::new(max_pdu));

    let rq = AssociationRQ {
        protocol_version: PROTOCOL_VERSION,
        called_ae_title: node.ae_title.clone(),
        calling_ae_title: options.calling_ae_title.clone(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: options.presentation_contexts.clone(),
        user_variables: local_user_variables(max_pdu),
    };
    framed.send(Pdu::AssociationRQ(rq)).await?;

    let reply = match timeout(options.artim_timeout, framed.next()).await {
        Err(_) => {
            let _ = framed.send(user_abort()).await;
            return Err(DimseError::Timeout(format!(
                "no A-ASSOCIATE response from {}",
                node
            )));
        }
        Ok(None) => return Err(DimseError::ConnectionClosed),
        Ok(Some(reply)) => reply?,
    };

    let ac = match reply {
        Pdu::AssociationAC(ac) => ac,
        Pdu::AssociationRJ(rj) => return Err(DimseError::AssociationRejected(RejectReason::from(&rj))),
        Pdu::AbortRQ { source } => return Err(DimseError::Aborted(source)),
        other => {
            let _ = framed.send(user_abort()).await;
            return Err(DimseError::UnexpectedPdu(pdu_name(&other)));
        }
    };

    let presentation_contexts =
        accepted_contexts(&options.presentation_contexts, &ac.presentation_contexts);
    if presentation_contexts.is_empty() {
        let _ = framed.send(user_abort()).await;
        return Err(DimseError::NoPresentationContext(format!(
            "any proposed abstract syntax at {}",
            node
        )));
    }

    let info = AssociationInfo {
        calling_ae_title: options.calling_ae_title.clone(),
        called_ae_title: node.ae_title.clone(),
        peer_addr,
        peer_max_pdu: peer_max_length(&ac.user_variables),
        local_max_pdu: max_pdu,
        presentation_contexts,
        peer_implementation_class_uid: implementation_class(&ac.user_variables),
    };
    debug!(peer = %node, contexts = info.presentation_contexts.len(), "association established");
    Ok(Association::new(
        framed,
        info,
        options.artim_timeout,
        AssociationRole::Requestor,
    ))
}

/// What the reading half of an established association observed
#[derive(Debug)]
pub enum Inbound {
    Message(DimseMessage),
    ReleaseRequested,
    Aborted(AbortRQSource),
    Closed,
}

/// Reading half of an established association
pub struct AssociationReader {
    stream: PduStream,
    assembler: MessageAssembler,
    ready: VecDeque<DimseMessage>,
}

impl AssociationReader {
    /// Next event from the peer; P-DATA fragments are reassembled into messages
    pub async fn recv(&mut self) -> Result<Inbound> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(Inbound::Message(message));
            }
            let pdu = match self.stream.next().await {
                None => return Ok(Inbound::Closed),
                Some(pdu) => pdu?,
            };
            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        if let Some(message) = self.assembler.push(value)? {
                            self.ready.push_back(message);
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    if self.assembler.in_progress() {
                        return Err(DimseError::UnexpectedPdu(
                            "A-RELEASE-RQ inside a fragmented message".to_string(),
                        ));
                    }
                    return Ok(Inbound::ReleaseRequested);
                }
                Pdu::AbortRQ { source } => return Ok(Inbound::Aborted(source)),
                other => return Err(DimseError::UnexpectedPdu(pdu_name(&other))),
            }
        }
    }

    /// Waits for A-RELEASE-RP or a colliding A-RELEASE-RQ, discarding late P-DATA
    async fn await_release_reply(&mut self) -> Result<ReleaseEvent> {
        loop {
            match self.stream.next().await {
                None => return Err(DimseError::ConnectionClosed),
                Some(pdu) => match pdu? {
                    Pdu::ReleaseRP => return Ok(ReleaseEvent::Reply),
                    Pdu::ReleaseRQ => return Ok(ReleaseEvent::Collision),
                    Pdu::PData { .. } => continue,
                    Pdu::AbortRQ { source } => return Err(DimseError::Aborted(source)),
                    other => return Err(DimseError::UnexpectedPdu(pdu_name(&other))),
                },
            }
        }
    }
}

enum ReleaseEvent {
    Reply,
    Collision,
}

/// Writing half of an established association
pub struct AssociationWriter {
    sink: PduSink,
    info: Arc<AssociationInfo>,
}

impl AssociationWriter {
    /// Fragments and sends one DIMSE message
    pub async fn send_message(&mut self, message: DimseMessage) -> Result<()> {
        if self.info.context(message.presentation_context_id).is_none() {
            return Err(DimseError::NoPresentationContext(format!(
                "context ID {}",
                message.presentation_context_id
            )));
        }
        let fragments = message.into_fragments(self.info.max_fragment())?;
        for value in fragments {
            self.sink.feed(Pdu::PData { data: vec![value] }).await?;
        }
        self.sink.flush().await
    }

    pub async fn send_release_reply(&mut self) -> Result<()> {
        self.sink.send(Pdu::ReleaseRP).await?;
        self.sink.close().await
    }

    /// Sends A-ABORT and closes the connection
    pub async fn abort(&mut self, pdu: Pdu) -> Result<()> {
        self.sink.send(pdu).await?;
        self.sink.close().await
    }
}

/// An established association, owned by exactly one worker
pub struct Association {
    reader: AssociationReader,
    writer: AssociationWriter,
    info: Arc<AssociationInfo>,
    state: AssociationState,
    artim_timeout: Duration,
    role: AssociationRole,
    last_message_id: u16,
}

impl Association {
    fn new(
        framed: Framed<TcpStream, PduCodec>,
        info: AssociationInfo,
        artim_timeout: Duration,
        role: AssociationRole,
    ) -> Self {
        let info = Arc::new(info);
        let (sink, stream) = framed.split();
        Self {
            reader: AssociationReader {
                stream,
                assembler: MessageAssembler::new(),
                ready: VecDeque::new(),
            },
            writer: AssociationWriter {
                sink,
                info: Arc::clone(&info),
            },
            info,
            state: AssociationState::Established,
            artim_timeout,
            role,
            last_message_id: 0,
        }
    }

    pub fn info(&self) -> &Arc<AssociationInfo> {
        &self.info
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn role(&self) -> AssociationRole {
        self.role
    }

    /// Monotonic message ID for outgoing requests, never 0
    pub fn next_message_id(&mut self) -> u16 {
        self.last_message_id = self.last_message_id.wrapping_add(1);
        if self.last_message_id == 0 {
            self.last_message_id = 1;
        }
        self.last_message_id
    }

    pub async fn send_message(&mut self, message: DimseMessage) -> Result<()> {
        self.ensure_established()?;
        self.writer.send_message(message).await
    }

    /// Next complete DIMSE message; release, abort or close end the association
    pub async fn receive_message(&mut self, wait: Duration) -> Result<DimseMessage> {
        self.ensure_established()?;
        let event = match timeout(wait, self.reader.recv()).await {
            Err(_) => {
                self.abort().await?;
                return Err(DimseError::Timeout(
                    "no DIMSE response before timeout".to_string(),
                ));
            }
            Ok(event) => event,
        };
        match event {
            Ok(Inbound::Message(message)) => Ok(message),
            Ok(Inbound::ReleaseRequested) => {
                self.writer.send_release_reply().await?;
                self.state = AssociationState::Closed;
                Err(DimseError::ConnectionClosed)
            }
            Ok(Inbound::Aborted(source)) => {
                self.state = AssociationState::Closed;
                Err(DimseError::Aborted(source))
            }
            Ok(Inbound::Closed) => {
                self.state = AssociationState::Closed;
                Err(DimseError::ConnectionClosed)
            }
            Err(e) => {
                let _ = self.writer.abort(user_abort()).await;
                self.state = AssociationState::Closed;
                Err(e)
            }
        }
    }

    /// Orderly release: A-RELEASE-RQ then wait for A-RELEASE-RP under ARTIM
    ///
    /// On a release collision the requestor answers the peer's A-RELEASE-RQ
    /// right away, the acceptor only after its own A-RELEASE-RP arrived.
    pub async fn release(mut self) -> Result<()> {
        self.ensure_established()?;
        self.writer.sink.send(Pdu::ReleaseRQ).await?;
        self.state = AssociationState::Releasing;

        let role = self.role;
        let reader = &mut self.reader;
        let writer = &mut self.writer;
        let mut answer_after_reply = false;
        let outcome = timeout(self.artim_timeout, async {
            loop {
                match reader.await_release_reply().await? {
                    ReleaseEvent::Reply => return Ok::<(), DimseError>(()),
                    ReleaseEvent::Collision if role == AssociationRole::Requestor => {
                        debug!("release collision, answering as requestor");
                        writer.sink.send(Pdu::ReleaseRP).await?;
                    }
                    ReleaseEvent::Collision => {
                        debug!("release collision, answering after A-RELEASE-RP");
                        answer_after_reply = true;
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.state = AssociationState::Closed;
                if answer_after_reply {
                    self.writer.sink.send(Pdu::ReleaseRP).await?;
                }
                self.writer.sink.close().await
            }
            Ok(Err(e)) => {
                self.state = AssociationState::Closed;
                Err(e)
            }
            Err(_) => {
                warn!(peer = %self.info.peer_addr, "ARTIM expired waiting for A-RELEASE-RP");
                self.abort().await?;
                Err(DimseError::Timeout("A-RELEASE-RP".to_string()))
            }
        }
    }

    pub async fn abort(&mut self) -> Result<()> {
        self.state = AssociationState::Aborted;
        let result = self.writer.abort(user_abort()).await;
        self.state = AssociationState::Closed;
        result
    }

    /// Splits into independently usable halves for a provider worker
    pub fn into_parts(self) -> (AssociationReader, AssociationWriter, Arc<AssociationInfo>) {
        (self.reader, self.writer, self.info)
    }

    fn ensure_established(&self) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(DimseError::internal(format!(
                "association is {:?}, not established",
                self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(accept_unknown: bool) -> AcceptorOptions {
        let mut supported = HashMap::new();
        supported.insert(
            "1.2.840.10008.1.1".to_string(),
            vec!["1.2.840.10008.1.2".to_string()],
        );
        supported.insert(
            "1.2.840.10008.5.1.4.1.1.7".to_string(),
            vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
            ],
        );
        AcceptorOptions {
            ae_title: "MUPACS".to_string(),
            max_pdu: 16384,
            supported,
            accept_unknown_calling_aets: accept_unknown,
            peers: Arc::new(vec![RemoteNode::new("KNOWN", "localhost", 104)]),
            artim_timeout: Duration::from_secs(5),
        }
    }

    fn rq(calling: &str, called: &str, contexts: Vec<PresentationContextProposed>) -> AssociationRQ {
        AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            called_ae_title: called.to_string(),
            calling_ae_title: calling.to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: contexts,
            user_variables: vec![UserVariableItem::MaxLength(32768)],
        }
    }

    fn pc(id: u8, abstract_syntax: &str, ts: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: ts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_first_supported_transfer_syntax_in_proposer_order() {
        let request = rq(
            "MODALITY",
            "MUPACS",
            vec![pc(
                1,
                "1.2.840.10008.5.1.4.1.1.7",
                &["1.2.840.10008.1.2.4.50", "1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
            )],
        );
        let results = negotiate(&request, &options(true)).unwrap();
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[0].transfer_syntax, "1.2.840.10008.1.2.1");
    }

    #[test]
    fn test_unsupported_context_rejected_individually() {
        let request = rq(
            "MODALITY",
            "MUPACS",
            vec![
                pc(1, "1.2.3.4.5.6", &["1.2.840.10008.1.2"]),
                pc(3, "1.2.840.10008.1.1", &["1.2.840.10008.1.2.1"]),
                pc(5, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"]),
            ],
        );
        let results = negotiate(&request, &options(true)).unwrap();
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(
            results[1].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
        assert_eq!(results[2].reason, PresentationContextResultReason::Acceptance);
    }

    #[test]
    fn test_called_ae_not_recognized() {
        let request = rq("MODALITY", "SOMEONE", vec![pc(1, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"])]);
        let reason = negotiate(&request, &options(true)).unwrap_err();
        assert_eq!(reason.cause, RejectCause::CalledAeNotRecognized);
    }

    #[test]
    fn test_calling_ae_checked_only_in_strict_mode() {
        let contexts = vec![pc(1, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"])];
        let stranger = rq("STRANGER", "MUPACS", contexts.clone());
        assert!(negotiate(&stranger, &options(true)).is_ok());
        assert_eq!(
            negotiate(&stranger, &options(false)).unwrap_err().cause,
            RejectCause::CallingAeNotRecognized
        );
        let known = rq("KNOWN", "MUPACS", contexts);
        assert!(negotiate(&known, &options(false)).is_ok());
    }

    #[test]
    fn test_reject_when_no_context_acceptable() {
        let request = rq("MODALITY", "MUPACS", vec![pc(1, "1.2.3", &["1.2.840.10008.1.2"])]);
        let reason = negotiate(&request, &options(true)).unwrap_err();
        assert_eq!(reason.cause, RejectCause::NoReasonGiven);
    }

    #[test]
    fn test_wrong_application_context() {
        let mut request = rq("MODALITY", "MUPACS", vec![pc(1, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"])]);
        request.application_context_name = "1.2.3.4".to_string();
        assert_eq!(
            negotiate(&request, &options(true)).unwrap_err().cause,
            RejectCause::ApplicationContextNotSupported
        );
    }

    const RELEASE_RQ: [u8; 10] = [0x05, 0, 0, 0, 0, 4, 0, 0, 0, 0];
    const RELEASE_RP: [u8; 10] = [0x06, 0, 0, 0, 0, 4, 0, 0, 0, 0];

    async fn established(role: AssociationRole) -> (Association, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (local, peer) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let local = local.unwrap();
        let (peer, _) = peer.unwrap();
        let info = AssociationInfo {
            calling_ae_title: "MODALITY".to_string(),
            called_ae_title: "MUPACS".to_string(),
            peer_addr: addr,
            peer_max_pdu: 16384,
            local_max_pdu: 16384,
            presentation_contexts: Vec::new(),
            peer_implementation_class_uid: None,
        };
        let association = Association::new(
            Framed::new(local, PduCodec::new(16384)),
            info,
            Duration::from_secs(5),
            role,
        );
        (association, peer)
    }

    async fn read_pdu_bytes(peer: &mut TcpStream) -> [u8; 10] {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 10];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_release_collision_as_requestor_answers_first() {
        use tokio::io::AsyncWriteExt;
        let (association, mut peer) = established(AssociationRole::Requestor).await;
        let release = tokio::spawn(association.release());

        assert_eq!(read_pdu_bytes(&mut peer).await, RELEASE_RQ);
        peer.write_all(&RELEASE_RQ).await.unwrap();
        assert_eq!(read_pdu_bytes(&mut peer).await, RELEASE_RP);
        peer.write_all(&RELEASE_RP).await.unwrap();

        release.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_release_collision_as_acceptor_answers_after_reply() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (association, mut peer) = established(AssociationRole::Acceptor).await;
        let release = tokio::spawn(association.release());

        assert_eq!(read_pdu_bytes(&mut peer).await, RELEASE_RQ);
        peer.write_all(&RELEASE_RQ).await.unwrap();
        peer.write_all(&RELEASE_RP).await.unwrap();

        release.await.unwrap().unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, RELEASE_RP.to_vec());
    }

    #[test]
    fn test_proposal_ids_are_odd() {
        let options = RequestorOptions::propose(
            "MUPACS",
            &[
                ("1.2.840.10008.1.1".to_string(), vec!["1.2.840.10008.1.2".to_string()]),
                ("1.2.840.10008.5.1.4.1.1.7".to_string(), vec!["1.2.840.10008.1.2".to_string()]),
            ],
        )
        .unwrap();
        let ids: Vec<u8> = options.presentation_contexts.iter().map(|pc| pc.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
