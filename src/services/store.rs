//! Storage Service (C-STORE SCP) and the store transaction shared with folder import

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use dimse::message::{read_data_set, write_data_set};
use dimse::{
    sop_class, status, DimseResponse, DimseStatus, RequestContext, ServiceClass, StoreHandler,
    StoreRequest,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::with_index;
use crate::config::DuplicatePolicy;
use crate::index::{ArchiveIndex, DatasetAttributes, IndexError, InsertOutcome, MissingAttribute};
use crate::storage::{ObjectKey, ObjectStore, StorageError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("AE '{0}' is not allowed to store")]
    NotAuthorized(String),

    #[error("unreadable data set: {0}")]
    Unreadable(String),

    #[error(transparent)]
    MissingAttribute(#[from] MissingAttribute),

    #[error("SOP Class {found} does not match {declared}")]
    SopClassMismatch { declared: String, found: String },

    #[error("SOP Instance UID {found} does not match {declared}")]
    InstanceMismatch { declared: String, found: String },

    #[error("SOP Instance {0} is already archived")]
    Duplicate(String),

    #[error("object store: {0}")]
    Storage(#[from] StorageError),

    #[error("archive index: {0}")]
    Index(IndexError),
}

impl From<IndexError> for StoreError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Duplicate(uid) => StoreError::Duplicate(uid),
            other => StoreError::Index(other),
        }
    }
}

impl StoreError {
    /// C-STORE-RSP status reported for this failure
    pub fn status(&self) -> u16 {
        match self {
            StoreError::NotAuthorized(_) => status::NOT_AUTHORIZED,
            StoreError::Unreadable(_) => status::CANNOT_UNDERSTAND,
            StoreError::MissingAttribute(_)
            | StoreError::SopClassMismatch { .. }
            | StoreError::InstanceMismatch { .. }
            | StoreError::Storage(StorageError::InvalidKey(_)) => {
                status::DATA_SET_DOES_NOT_MATCH_SOP_CLASS
            }
            StoreError::Duplicate(_) => status::DUPLICATE_SOP_INSTANCE,
            StoreError::Storage(_) | StoreError::Index(_) => status::PROCESSING_FAILURE,
        }
    }
}

/// One data set to archive
#[derive(Debug, Clone)]
pub struct StoreInput {
    /// SOP Class the sender declared for the data set
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax `data` is encoded in
    pub transfer_syntax: String,
    pub data: Bytes,
    /// Sending AE, `None` for local imports
    pub calling_ae: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    pub sop_instance_uid: String,
    pub object_key: ObjectKey,
    pub replaced: bool,
    /// Attributes were normalized before storing
    pub coerced: bool,
}

/// Serializes stores of the same SOP Instance UID
#[derive(Debug, Default)]
struct UidLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UidLocks {
    fn lease(&self, uid: &str) -> UidLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(uid.to_string()).or_default());
        UidLease {
            locks: self,
            uid: uid.to_string(),
            lock,
        }
    }
}

/// A claim on the lock of one UID; the map entry goes away with the last lease
struct UidLease<'a> {
    locks: &'a UidLocks,
    uid: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for UidLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference is the map's, one is ours
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.uid);
        }
    }
}

/// Validates incoming data sets and commits them to the object store and index
pub struct StorageService {
    index: Arc<ArchiveIndex>,
    store: Arc<dyn ObjectStore>,
    policy: DuplicatePolicy,
    transfer_syntaxes: Vec<String>,
    locks: UidLocks,
}

impl StorageService {
    pub fn new(
        index: Arc<ArchiveIndex>,
        store: Arc<dyn ObjectStore>,
        policy: DuplicatePolicy,
        transfer_syntaxes: Vec<String>,
    ) -> Self {
        Self {
            index,
            store,
            policy,
            transfer_syntaxes,
            locks: UidLocks::default(),
        }
    }

    /// Runs the store transaction for one data set
    ///
    /// The object is written under a fresh key before the index commits; the
    /// index commit is what makes it visible. A failed commit removes the new
    /// object and a replacement removes the previous one afterwards.
    pub async fn ingest(&self, input: StoreInput) -> Result<StoreReport, StoreError> {
        if let Some(calling_ae) = &input.calling_ae {
            let ae = calling_ae.clone();
            let record = with_index(&self.index, move |index| index.ae(&ae)).await?;
            if matches!(record, Some(ref r) if !r.store) {
                return Err(StoreError::NotAuthorized(calling_ae.clone()));
            }
        }

        let mut obj = read_data_set(&input.data, &input.transfer_syntax)
            .map_err(|e| StoreError::Unreadable(e.to_string()))?;
        let attributes = DatasetAttributes::read(&obj)?;
        if attributes.sop_class_uid() != input.sop_class_uid {
            return Err(StoreError::SopClassMismatch {
                declared: input.sop_class_uid,
                found: attributes.sop_class_uid().to_string(),
            });
        }
        if attributes.sop_instance_uid() != input.sop_instance_uid {
            return Err(StoreError::InstanceMismatch {
                declared: input.sop_instance_uid,
                found: attributes.sop_instance_uid().to_string(),
            });
        }

        let coerced = attributes.is_coerced();
        let data = if coerced {
            attributes.apply_coercions(&mut obj);
            write_data_set(&obj, &input.transfer_syntax)
                .map_err(|e| StoreError::Unreadable(e.to_string()))?
        } else {
            input.data
        };

        let uid = input.sop_instance_uid;
        let lease = self.locks.lease(&uid);
        let result = {
            let _guard = lease.lock.lock().await;
            self.commit(&uid, &input.transfer_syntax, attributes, &data).await
        };
        drop(lease);

        let (object_key, replaced) = result?;
        info!(
            sop_instance_uid = %uid,
            key = %object_key,
            replaced,
            coerced,
            "stored instance"
        );
        Ok(StoreReport {
            sop_instance_uid: uid,
            object_key,
            replaced,
            coerced,
        })
    }

    async fn commit(
        &self,
        uid: &str,
        transfer_syntax: &str,
        attributes: DatasetAttributes,
        data: &[u8],
    ) -> Result<(ObjectKey, bool), StoreError> {
        if self.policy == DuplicatePolicy::Reject {
            let lookup = uid.to_string();
            if with_index(&self.index, move |index| index.instance(&lookup))
                .await?
                .is_some()
            {
                return Err(StoreError::Duplicate(uid.to_string()));
            }
        }

        let key = self.store.put(uid, data).await?;
        let entry = attributes.into_entry(transfer_syntax, key.clone());
        let policy = self.policy;
        let outcome = with_index(&self.index, move |index| index.insert(&entry, policy)).await;

        match outcome {
            Ok(InsertOutcome::Created) => Ok((key, false)),
            Ok(InsertOutcome::Replaced(previous)) => {
                if let Err(e) = self.store.remove(&previous.object_key).await {
                    warn!(key = %previous.object_key, "failed to remove replaced object: {}", e);
                }
                Ok((key, true))
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove(&key).await {
                    warn!(key = %key, "failed to remove uncommitted object: {}", cleanup);
                }
                Err(e.into())
            }
        }
    }
}

impl ServiceClass for StorageService {
    fn sop_classes(&self) -> Vec<String> {
        sop_class::STORAGE.iter().map(|uid| uid.to_string()).collect()
    }

    fn transfer_syntaxes(&self) -> Vec<String> {
        self.transfer_syntaxes.clone()
    }
}

#[async_trait]
impl StoreHandler for StorageService {
    async fn store(&self, ctx: &RequestContext, request: StoreRequest) -> DimseResponse {
        debug!(
            message_id = ctx.message_id,
            sop_instance_uid = %request.sop_instance_uid,
            "C-STORE"
        );
        if request.sop_class_uid != ctx.sop_class_uid() {
            return DimseResponse::failure(
                status::DATA_SET_DOES_NOT_MATCH_SOP_CLASS,
                format!(
                    "Affected SOP Class {} differs from presentation context {}",
                    request.sop_class_uid,
                    ctx.sop_class_uid()
                ),
            );
        }

        let input = StoreInput {
            sop_class_uid: request.sop_class_uid,
            sop_instance_uid: request.sop_instance_uid,
            transfer_syntax: ctx.transfer_syntax().to_string(),
            data: request.data,
            calling_ae: Some(ctx.calling_ae_title().to_string()),
        };
        match self.ingest(input).await {
            Ok(report) if report.coerced => {
                DimseResponse::new(DimseStatus::Warning(status::COERCION_OF_DATA_ELEMENTS))
            }
            Ok(_) => DimseResponse::success(),
            Err(e) => {
                warn!(calling_ae = %ctx.calling_ae_title(), "C-STORE failed: {}", e);
                DimseResponse::failure(e.status(), e.to_string())
            }
        }
    }
}
