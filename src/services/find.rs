//! Query Service (C-FIND SCP)

use std::sync::Arc;

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use dimse::sop_class::{self, InformationModel};
use dimse::{
    status, DimseResponse, DimseStatus, FindHandler, PendingResponses, RequestContext,
    ServiceClass,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::with_index;
use crate::index::{ArchiveIndex, IndexQuery, QueryError};

/// Status for an identifier the index cannot evaluate
pub(crate) fn query_error_status(error: &QueryError) -> u16 {
    match error {
        QueryError::LevelNotInModel { .. } => status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
        QueryError::MissingLevel | QueryError::InvalidLevel(_) | QueryError::InvalidKey { .. } => {
            status::CANNOT_UNDERSTAND
        }
    }
}

/// Parses an identifier under the information model of the request's SOP class
pub(crate) fn parse_query(
    ctx: &RequestContext,
    identifier: &InMemDicomObject,
    match_absent: bool,
) -> Result<IndexQuery, DimseResponse> {
    let model = InformationModel::from_sop_class(ctx.sop_class_uid()).ok_or_else(|| {
        DimseResponse::failure(
            status::SOP_CLASS_NOT_SUPPORTED,
            format!("{} is not a query/retrieve model", ctx.sop_class_uid()),
        )
    })?;
    IndexQuery::from_identifier(identifier, model)
        .map(|query| query.match_absent(match_absent))
        .map_err(|e| DimseResponse::failure(query_error_status(&e), e.to_string()))
}

/// Answers C-FIND requests from the archive index
pub struct QueryService {
    index: Arc<ArchiveIndex>,
    match_absent: bool,
    transfer_syntaxes: Vec<String>,
}

impl QueryService {
    pub fn new(index: Arc<ArchiveIndex>, match_absent: bool, transfer_syntaxes: Vec<String>) -> Self {
        Self {
            index,
            match_absent,
            transfer_syntaxes,
        }
    }
}

impl ServiceClass for QueryService {
    fn sop_classes(&self) -> Vec<String> {
        vec![
            sop_class::PATIENT_ROOT_FIND.to_string(),
            sop_class::STUDY_ROOT_FIND.to_string(),
        ]
    }

    fn transfer_syntaxes(&self) -> Vec<String> {
        self.transfer_syntaxes.clone()
    }
}

#[async_trait]
impl FindHandler for QueryService {
    async fn find(
        &self,
        ctx: &RequestContext,
        identifier: InMemDicomObject,
        pending: PendingResponses,
        cancel: CancellationToken,
    ) -> DimseResponse {
        let query = match parse_query(ctx, &identifier, self.match_absent) {
            Ok(query) => query,
            Err(response) => return response,
        };
        debug!(
            message_id = ctx.message_id,
            level = %query.level(),
            keys = query.keys().len(),
            "C-FIND"
        );

        let lookup = query.clone();
        let rows = match with_index(&self.index, move |index| index.find(&lookup)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("C-FIND index lookup failed: {}", e);
                return DimseResponse::failure(status::UNABLE_TO_PROCESS, e.to_string());
            }
        };

        let total = rows.len();
        for (sent, row) in rows.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(sent, total, "C-FIND cancelled");
                return DimseResponse::new(DimseStatus::Cancel);
            }
            if !pending.send(DimseResponse::pending(row.to_identifier(&query))).await {
                debug!("association closed during C-FIND");
                return DimseResponse::new(DimseStatus::Cancel);
            }
        }
        if cancel.is_cancelled() {
            return DimseResponse::new(DimseStatus::Cancel);
        }
        info!(level = %query.level(), matches = total, "C-FIND completed");
        DimseResponse::success()
    }
}
