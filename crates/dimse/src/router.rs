//! DIMSE dispatcher: routes complete messages to registered service handlers
//!
//! Services implement one or more capability traits ([`EchoHandler`],
//! [`StoreHandler`], [`FindHandler`], [`MoveHandler`]) and are registered
//! with a [`ServiceRegistry`] at startup. Each registration records the
//! SOP classes the service accepts, keyed together with the request
//! command, and feeds the presentation context negotiation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dicom_object::InMemDicomObject;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::association::{AssociationInfo, AssociationWriter, PresentationContext};
use crate::message::{read_data_set, write_data_set, CommandSet, DimseMessage, SubOperations};
use crate::types::{status, CommandField, DimseStatus, Priority};
use crate::{DimseError, Result};

/// Per-request view handed to a service
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub association: Arc<AssociationInfo>,
    pub presentation_context: PresentationContext,
    pub message_id: u16,
    pub priority: Priority,
}

impl RequestContext {
    pub fn calling_ae_title(&self) -> &str {
        &self.association.calling_ae_title
    }

    pub fn sop_class_uid(&self) -> &str {
        &self.presentation_context.abstract_syntax
    }

    pub fn transfer_syntax(&self) -> &str {
        &self.presentation_context.transfer_syntax
    }
}

/// Response produced by a service for one request
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub status: DimseStatus,
    pub identifier: Option<InMemDicomObject>,
    pub sub_operations: Option<SubOperations>,
    pub error_comment: Option<String>,
}

impl DimseResponse {
    pub fn new(status: DimseStatus) -> Self {
        Self {
            status,
            identifier: None,
            sub_operations: None,
            error_comment: None,
        }
    }

    pub fn success() -> Self {
        Self::new(DimseStatus::Success)
    }

    /// Pending C-FIND match
    pub fn pending(identifier: InMemDicomObject) -> Self {
        Self::new(DimseStatus::Pending).with_identifier(identifier)
    }

    pub fn failure(code: u16, comment: impl Into<String>) -> Self {
        Self::new(DimseStatus::Failure(code)).with_error_comment(comment)
    }

    pub fn with_identifier(mut self, identifier: InMemDicomObject) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn with_sub_operations(mut self, counts: SubOperations) -> Self {
        self.sub_operations = Some(counts);
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        self.error_comment = Some(comment.into());
        self
    }
}

/// Channel for the pending responses of a C-FIND or C-MOVE
///
/// Responses are written to the peer in the order they are sent here and
/// always before the final response returned by the handler.
#[derive(Debug, Clone)]
pub struct PendingResponses {
    tx: mpsc::Sender<DimseResponse>,
}

impl PendingResponses {
    pub fn new(tx: mpsc::Sender<DimseResponse>) -> Self {
        Self { tx }
    }

    /// Returns false once the association can no longer carry responses
    pub async fn send(&self, response: DimseResponse) -> bool {
        self.tx.send(response).await.is_ok()
    }
}

/// A C-STORE request with its data set
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub data: Bytes,
    pub move_originator: Option<(String, u16)>,
}

/// A C-MOVE request
#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub destination: String,
    pub identifier: InMemDicomObject,
}

/// Common surface of every service: the SOP classes it registers for
pub trait ServiceClass: Send + Sync {
    fn sop_classes(&self) -> Vec<String>;

    /// Transfer syntaxes accepted on this service's presentation contexts
    fn transfer_syntaxes(&self) -> Vec<String> {
        crate::sop_class::uncompressed_transfer_syntaxes()
    }
}

#[async_trait]
pub trait EchoHandler: ServiceClass {
    async fn echo(&self, ctx: &RequestContext) -> DimseResponse;
}

#[async_trait]
pub trait StoreHandler: ServiceClass {
    async fn store(&self, ctx: &RequestContext, request: StoreRequest) -> DimseResponse;
}

#[async_trait]
pub trait FindHandler: ServiceClass {
    async fn find(
        &self,
        ctx: &RequestContext,
        identifier: InMemDicomObject,
        pending: PendingResponses,
        cancel: CancellationToken,
    ) -> DimseResponse;
}

#[async_trait]
pub trait MoveHandler: ServiceClass {
    async fn retrieve(
        &self,
        ctx: &RequestContext,
        request: MoveRequest,
        pending: PendingResponses,
        cancel: CancellationToken,
    ) -> DimseResponse;
}

#[derive(Clone)]
enum Handler {
    Echo(Arc<dyn EchoHandler>),
    Store(Arc<dyn StoreHandler>),
    Find(Arc<dyn FindHandler>),
    Move(Arc<dyn MoveHandler>),
}

/// Registry mapping `(command, SOP class)` to the service handling it
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<(CommandField, String), Handler>,
    transfer_syntaxes: HashMap<String, Vec<String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &mut self,
        command: CommandField,
        sop_classes: Vec<String>,
        transfer_syntaxes: Vec<String>,
        handler: Handler,
    ) {
        for sop_class in sop_classes {
            let accepted = self.transfer_syntaxes.entry(sop_class.clone()).or_default();
            for ts in &transfer_syntaxes {
                if !accepted.contains(ts) {
                    accepted.push(ts.clone());
                }
            }
            debug!(%command, %sop_class, "registered handler");
            self.handlers
                .insert((command, sop_class), handler.clone());
        }
    }

    pub fn register_echo(&mut self, service: Arc<dyn EchoHandler>) {
        self.register(
            CommandField::CEchoRq,
            service.sop_classes(),
            service.transfer_syntaxes(),
            Handler::Echo(service),
        );
    }

    pub fn register_store(&mut self, service: Arc<dyn StoreHandler>) {
        self.register(
            CommandField::CStoreRq,
            service.sop_classes(),
            service.transfer_syntaxes(),
            Handler::Store(service),
        );
    }

    pub fn register_find(&mut self, service: Arc<dyn FindHandler>) {
        self.register(
            CommandField::CFindRq,
            service.sop_classes(),
            service.transfer_syntaxes(),
            Handler::Find(service),
        );
    }

    pub fn register_move(&mut self, service: Arc<dyn MoveHandler>) {
        self.register(
            CommandField::CMoveRq,
            service.sop_classes(),
            service.transfer_syntaxes(),
            Handler::Move(service),
        );
    }

    /// Abstract syntax -> accepted transfer syntaxes, for association negotiation
    pub fn supported_contexts(&self) -> HashMap<String, Vec<String>> {
        self.transfer_syntaxes.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Processes one request message and writes every response it produces
    pub async fn dispatch(
        &self,
        info: &Arc<AssociationInfo>,
        message: DimseMessage,
        writer: &mut AssociationWriter,
        cancel: CancellationToken,
    ) -> Result<()> {
        let pc = info
            .context(message.presentation_context_id)
            .cloned()
            .ok_or_else(|| {
                DimseError::malformed(format!(
                    "message on unaccepted presentation context {}",
                    message.presentation_context_id
                ))
            })?;
        let command = message.command.command_field()?;
        let Some(response_field) = command.response() else {
            warn!(%command, "ignoring non-request command");
            return Ok(());
        };
        let message_id = message.command.message_id().ok_or_else(|| {
            DimseError::DicomParsing(format!("{} without Message ID", command))
        })?;

        let ctx = RequestContext {
            association: Arc::clone(info),
            presentation_context: pc.clone(),
            message_id,
            priority: message.command.priority(),
        };
        let reply = Reply {
            field: response_field,
            message_id,
            context: &pc,
        };
        debug!(%command, message_id, sop_class = %pc.abstract_syntax, "dispatching");

        let handler = self
            .handlers
            .get(&(command, pc.abstract_syntax.clone()))
            .cloned();

        match handler {
            None => {
                let instance = message.command.affected_sop_instance_uid();
                let response = DimseResponse::failure(
                    status::SOP_CLASS_NOT_SUPPORTED,
                    format!("{} not supported for {}", command, pc.abstract_syntax),
                );
                reply.send(writer, instance.as_deref(), response).await
            }
            Some(Handler::Echo(service)) => {
                let response = service.echo(&ctx).await;
                reply.send(writer, None, response).await
            }
            Some(Handler::Store(service)) => {
                let instance = message.command.affected_sop_instance_uid();
                let response = match (message.data, instance.as_deref()) {
                    (Some(data), Some(sop_instance_uid)) => {
                        let request = StoreRequest {
                            sop_class_uid: message
                                .command
                                .affected_sop_class_uid()
                                .unwrap_or_else(|| pc.abstract_syntax.clone()),
                            sop_instance_uid: sop_instance_uid.to_string(),
                            data,
                            move_originator: message.command.move_originator(),
                        };
                        service.store(&ctx, request).await
                    }
                    (None, _) => DimseResponse::failure(
                        status::CANNOT_UNDERSTAND,
                        "C-STORE-RQ without data set",
                    ),
                    (_, None) => DimseResponse::failure(
                        status::CANNOT_UNDERSTAND,
                        "C-STORE-RQ without Affected SOP Instance UID",
                    ),
                };
                reply.send(writer, instance.as_deref(), response).await
            }
            Some(Handler::Find(service)) => {
                let identifier = match decode_identifier(message.data, &pc) {
                    Ok(identifier) => identifier,
                    Err(response) => return reply.send(writer, None, response).await,
                };
                let (tx, rx) = mpsc::channel(16);
                let work = service.find(&ctx, identifier, PendingResponses::new(tx), cancel.clone());
                reply.stream(writer, work, rx, cancel).await
            }
            Some(Handler::Move(service)) => {
                let identifier = match decode_identifier(message.data, &pc) {
                    Ok(identifier) => identifier,
                    Err(response) => return reply.send(writer, None, response).await,
                };
                let Some(destination) = message.command.move_destination().filter(|d| !d.is_empty())
                else {
                    let response = DimseResponse::failure(
                        status::MOVE_DESTINATION_UNKNOWN,
                        "C-MOVE-RQ without Move Destination",
                    )
                    .with_sub_operations(SubOperations::default());
                    return reply.send(writer, None, response).await;
                };
                let request = MoveRequest {
                    destination,
                    identifier,
                };
                let (tx, rx) = mpsc::channel(16);
                let work = service.retrieve(&ctx, request, PendingResponses::new(tx), cancel.clone());
                reply.stream(writer, work, rx, cancel).await
            }
        }
    }
}

fn decode_identifier(
    data: Option<Bytes>,
    pc: &PresentationContext,
) -> std::result::Result<InMemDicomObject, DimseResponse> {
    let data = data.ok_or_else(|| {
        DimseResponse::failure(status::CANNOT_UNDERSTAND, "request without identifier")
    })?;
    read_data_set(&data, &pc.transfer_syntax).map_err(|e| {
        DimseResponse::failure(status::CANNOT_UNDERSTAND, format!("unreadable identifier: {}", e))
    })
}

/// Addressing shared by every response to one request
struct Reply<'a> {
    field: CommandField,
    message_id: u16,
    context: &'a PresentationContext,
}

impl Reply<'_> {
    async fn send(
        &self,
        writer: &mut AssociationWriter,
        sop_instance_uid: Option<&str>,
        response: DimseResponse,
    ) -> Result<()> {
        let data = match &response.identifier {
            Some(identifier) => Some(write_data_set(identifier, &self.context.transfer_syntax)?),
            None => None,
        };
        let mut command = CommandSet::response(
            self.field,
            self.message_id,
            Some(&self.context.abstract_syntax),
            sop_instance_uid,
            response.status,
            data.is_some(),
        );
        if let Some(counts) = response.sub_operations {
            command = command.with_sub_operations(counts);
        }
        if let Some(comment) = &response.error_comment {
            if response.status.is_failure() {
                command = command.with_error_comment(comment);
            }
        }
        writer
            .send_message(DimseMessage::new(self.context.id, command, data))
            .await
    }

    /// Forwards pending responses while the handler runs, then sends its final response
    async fn stream<F>(
        &self,
        writer: &mut AssociationWriter,
        work: F,
        mut rx: mpsc::Receiver<DimseResponse>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        F: std::future::Future<Output = DimseResponse>,
    {
        let mut write_error = None;
        let forward = async {
            while let Some(pending) = rx.recv().await {
                if write_error.is_some() {
                    continue;
                }
                if let Err(e) = self.send(writer, None, pending).await {
                    cancel.cancel();
                    write_error = Some(e);
                }
            }
        };
        let (final_response, ()) = tokio::join!(work, forward);
        if let Some(e) = write_error {
            return Err(e);
        }
        self.send(writer, None, final_response).await
    }
}
