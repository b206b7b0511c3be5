//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::time::Duration;

use bytes::Bytes;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::{debug, info, warn};

use crate::association::{self, Association, AssociationInfo, PresentationContext, RequestorOptions};
use crate::config::{DimseConfig, RemoteNode};
use crate::message::{read_data_set, write_data_set, CommandSet, DimseMessage, SubOperations};
use crate::sop_class;
use crate::types::{CommandField, DimseStatus, FindQuery, MoveQuery, Priority};
use crate::{DimseError, Result};

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    config: DimseConfig,
}

/// Final C-STORE-RSP of one sub-operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub status: DimseStatus,
    pub error_comment: Option<String>,
}

/// Responses of a C-FIND
#[derive(Debug, Clone)]
pub struct FindResults {
    pub matches: Vec<InMemDicomObject>,
    pub status: DimseStatus,
}

/// Final C-MOVE-RSP and the pending tallies seen on the way
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    pub status: DimseStatus,
    pub sub_operations: SubOperations,
    pub progress: Vec<SubOperations>,
    pub error_comment: Option<String>,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn local_aet(&self) -> &str {
        &self.config.local_aet
    }

    /// Open an association proposing the given abstract syntaxes
    pub async fn connect(
        &self,
        node: &RemoteNode,
        abstract_syntaxes: &[(String, Vec<String>)],
    ) -> Result<ScuAssociation> {
        node.validate()?;
        let mut options = RequestorOptions::propose(&self.config.local_aet, abstract_syntaxes)?;
        options.max_pdu = self.config.max_pdu;
        options.connect_timeout = self.config.connect_timeout();
        options.artim_timeout = self.config.artim_timeout();

        debug!("Requesting association with {}", node);
        let association = association::request(node, &options).await?;
        Ok(ScuAssociation {
            association,
            response_timeout: self.config.association_timeout(),
        })
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<DimseStatus> {
        info!("Sending C-ECHO to {}", node);
        let mut association = self
            .connect(
                node,
                &[(
                    sop_class::VERIFICATION.to_string(),
                    self.config.preferred_transfer_syntaxes.clone(),
                )],
            )
            .await?;
        let status = association.echo().await?;
        association.release().await?;
        Ok(status)
    }

    /// Run a C-FIND against a remote node with the given information model
    pub async fn find(
        &self,
        node: &RemoteNode,
        model_uid: &str,
        query: &FindQuery,
    ) -> Result<FindResults> {
        info!("Sending C-FIND to {} (level: {})", node, query.query_level);
        let mut association = self
            .connect(
                node,
                &[(model_uid.to_string(), self.config.preferred_transfer_syntaxes.clone())],
            )
            .await?;
        let results = association.find(model_uid, &query.to_identifier()).await?;
        association.release().await?;
        Ok(results)
    }

    /// Ask a remote node to move matching instances to `query.destination_aet`
    pub async fn move_to(
        &self,
        node: &RemoteNode,
        model_uid: &str,
        query: &MoveQuery,
    ) -> Result<MoveOutcome> {
        info!(
            "Sending C-MOVE to {} (level: {}, dest: {})",
            node, query.query_level, query.destination_aet
        );
        let mut association = self
            .connect(
                node,
                &[(model_uid.to_string(), self.config.preferred_transfer_syntaxes.clone())],
            )
            .await?;
        let outcome = association.move_request(model_uid, query).await?;
        association.release().await?;
        Ok(outcome)
    }
}

/// Requestor side of an established association
pub struct ScuAssociation {
    association: Association,
    response_timeout: Duration,
}

impl ScuAssociation {
    pub fn info(&self) -> &AssociationInfo {
        self.association.info()
    }

    fn context(&self, abstract_syntax: &str) -> Result<PresentationContext> {
        self.info()
            .context_for(abstract_syntax)
            .cloned()
            .ok_or_else(|| DimseError::NoPresentationContext(abstract_syntax.to_string()))
    }

    /// Picks a context for a stored data set and re-encodes it when only a
    /// different uncompressed transfer syntax was accepted
    fn store_context(
        &self,
        sop_class_uid: &str,
        transfer_syntax_uid: &str,
        data: Bytes,
    ) -> Result<(PresentationContext, Bytes)> {
        let candidates: Vec<&PresentationContext> = self
            .info()
            .presentation_contexts
            .iter()
            .filter(|pc| pc.abstract_syntax == sop_class_uid)
            .collect();

        if let Some(pc) = candidates
            .iter()
            .find(|pc| pc.transfer_syntax == transfer_syntax_uid)
        {
            return Ok(((*pc).clone(), data));
        }

        let source = TransferSyntaxRegistry.get(transfer_syntax_uid).ok_or_else(|| {
            DimseError::NotSupported(format!("transfer syntax {}", transfer_syntax_uid))
        })?;
        let target = candidates.into_iter().find(|pc| {
            TransferSyntaxRegistry
                .get(&pc.transfer_syntax)
                .map(|ts| source.is_codec_free() && ts.is_codec_free())
                .unwrap_or(false)
        });
        match target {
            Some(pc) => {
                debug!(
                    from = transfer_syntax_uid,
                    to = %pc.transfer_syntax,
                    "re-encoding data set for negotiated transfer syntax"
                );
                let obj = read_data_set(&data, transfer_syntax_uid)?;
                let data = write_data_set(&obj, &pc.transfer_syntax)?;
                Ok((pc.clone(), data))
            }
            None => Err(DimseError::NoPresentationContext(format!(
                "{} in {}",
                sop_class_uid, transfer_syntax_uid
            ))),
        }
    }

    /// Waits for the next message from the peer
    pub async fn receive(&mut self) -> Result<DimseMessage> {
        self.association.receive_message(self.response_timeout).await
    }

    /// Waits for the response answering `message_id`, skipping unrelated traffic
    async fn response_to(&mut self, message_id: u16, expected: CommandField) -> Result<DimseMessage> {
        loop {
            let message = self.receive().await?;
            let field = message.command.command_field()?;
            if field == expected && message.command.message_id_being_responded_to() == Some(message_id) {
                return Ok(message);
            }
            warn!(%field, "ignoring unexpected message while waiting for {}", expected);
        }
    }

    pub async fn echo(&mut self) -> Result<DimseStatus> {
        let pc = self.context(sop_class::VERIFICATION)?;
        let message_id = self.association.next_message_id();
        self.association
            .send_message(DimseMessage::new(pc.id, CommandSet::echo_rq(message_id), None))
            .await?;
        let response = self.response_to(message_id, CommandField::CEchoRsp).await?;
        status_of(&response)
    }

    /// Sends one C-STORE-RQ and waits for its response
    pub async fn store(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
        data: Bytes,
        move_originator: Option<(&str, u16)>,
    ) -> Result<StoreOutcome> {
        let (pc, data) = self.store_context(sop_class_uid, transfer_syntax_uid, data)?;
        let message_id = self.association.next_message_id();
        let command = CommandSet::store_rq(
            message_id,
            sop_class_uid,
            sop_instance_uid,
            Priority::Medium,
            move_originator,
        );
        self.association
            .send_message(DimseMessage::new(pc.id, command, Some(data)))
            .await?;
        let response = self.response_to(message_id, CommandField::CStoreRsp).await?;
        Ok(StoreOutcome {
            status: status_of(&response)?,
            error_comment: response.command.error_comment(),
        })
    }

    /// Sends a C-FIND-RQ without waiting; returns its message ID
    pub async fn send_find(&mut self, model_uid: &str, identifier: &InMemDicomObject) -> Result<u16> {
        let pc = self.context(model_uid)?;
        let message_id = self.association.next_message_id();
        let data = write_data_set(identifier, &pc.transfer_syntax)?;
        self.association
            .send_message(DimseMessage::new(
                pc.id,
                CommandSet::find_rq(message_id, model_uid, Priority::Medium),
                Some(data),
            ))
            .await?;
        Ok(message_id)
    }

    /// Sends a C-MOVE-RQ without waiting; returns its message ID
    pub async fn send_move(&mut self, model_uid: &str, query: &MoveQuery) -> Result<u16> {
        let pc = self.context(model_uid)?;
        let message_id = self.association.next_message_id();
        let data = write_data_set(&query.to_identifier(), &pc.transfer_syntax)?;
        self.association
            .send_message(DimseMessage::new(
                pc.id,
                CommandSet::move_rq(message_id, model_uid, &query.destination_aet, query.priority),
                Some(data),
            ))
            .await?;
        Ok(message_id)
    }

    /// Asks the peer to stop the C-FIND/C-MOVE identified by `message_id`
    pub async fn cancel(&mut self, model_uid: &str, message_id: u16) -> Result<()> {
        let pc = self.context(model_uid)?;
        self.association
            .send_message(DimseMessage::new(pc.id, CommandSet::cancel_rq(message_id), None))
            .await
    }

    /// Collects all C-FIND responses for a query
    pub async fn find(
        &mut self,
        model_uid: &str,
        identifier: &InMemDicomObject,
    ) -> Result<FindResults> {
        let pc = self.context(model_uid)?;
        let message_id = self.send_find(model_uid, identifier).await?;
        let mut matches = Vec::new();
        loop {
            let response = self.response_to(message_id, CommandField::CFindRsp).await?;
            let status = status_of(&response)?;
            if status.is_pending() {
                if let Some(data) = &response.data {
                    matches.push(read_data_set(data, &pc.transfer_syntax)?);
                }
                continue;
            }
            return Ok(FindResults { matches, status });
        }
    }

    /// Runs a C-MOVE to completion
    pub async fn move_request(&mut self, model_uid: &str, query: &MoveQuery) -> Result<MoveOutcome> {
        let message_id = self.send_move(model_uid, query).await?;
        let mut progress = Vec::new();
        loop {
            let response = self.response_to(message_id, CommandField::CMoveRsp).await?;
            let status = status_of(&response)?;
            let counts = response.command.sub_operations().unwrap_or_default();
            if status.is_pending() {
                progress.push(counts);
                continue;
            }
            return Ok(MoveOutcome {
                status,
                sub_operations: counts,
                progress,
                error_comment: response.command.error_comment(),
            });
        }
    }

    pub async fn release(self) -> Result<()> {
        self.association.release().await
    }

    pub async fn abort(mut self) -> Result<()> {
        self.association.abort().await
    }
}

fn status_of(message: &DimseMessage) -> Result<DimseStatus> {
    message
        .command
        .status()
        .ok_or_else(|| DimseError::DicomParsing("response without Status".to_string()))
}
