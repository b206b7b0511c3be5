//! Retrieve Service (C-MOVE SCP)
//!
//! Matching instances are forwarded to the destination AE over an outbound
//! association owned by a separate task. The task reports sub-operation
//! tallies back over a channel; each one becomes a Pending C-MOVE-RSP.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::sop_class;
use dimse::{
    status, DimseError, DimseResponse, DimseScu, DimseStatus, MoveHandler, MoveRequest,
    PendingResponses, RemoteNode, RequestContext, ServiceClass, SubOperations,
};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::find::parse_query;
use super::with_index;
use crate::index::{ArchiveIndex, InstanceRecord};
use crate::storage::ObjectStore;

/// Answers C-MOVE requests by pushing instances to the destination AE
pub struct RetrieveService {
    index: Arc<ArchiveIndex>,
    store: Arc<dyn ObjectStore>,
    scu: DimseScu,
    match_absent: bool,
    transfer_syntaxes: Vec<String>,
    moves: Arc<Semaphore>,
}

impl RetrieveService {
    pub fn new(
        index: Arc<ArchiveIndex>,
        store: Arc<dyn ObjectStore>,
        scu: DimseScu,
        match_absent: bool,
        transfer_syntaxes: Vec<String>,
        max_concurrent_moves: usize,
    ) -> Self {
        Self {
            index,
            store,
            scu,
            match_absent,
            transfer_syntaxes,
            moves: Arc::new(Semaphore::new(max_concurrent_moves)),
        }
    }
}

impl ServiceClass for RetrieveService {
    fn sop_classes(&self) -> Vec<String> {
        vec![
            sop_class::PATIENT_ROOT_MOVE.to_string(),
            sop_class::STUDY_ROOT_MOVE.to_string(),
        ]
    }

    fn transfer_syntaxes(&self) -> Vec<String> {
        self.transfer_syntaxes.clone()
    }
}

fn failure_without_sub_operations(code: u16, comment: impl Into<String>) -> DimseResponse {
    DimseResponse::failure(code, comment).with_sub_operations(SubOperations::default())
}

#[async_trait]
impl MoveHandler for RetrieveService {
    async fn retrieve(
        &self,
        ctx: &RequestContext,
        request: MoveRequest,
        pending: PendingResponses,
        cancel: CancellationToken,
    ) -> DimseResponse {
        let Ok(_permit) = Arc::clone(&self.moves).try_acquire_owned() else {
            warn!(destination = %request.destination, "too many concurrent C-MOVE operations");
            return failure_without_sub_operations(
                status::OUT_OF_RESOURCES_SUB_OPERATIONS,
                "maximum number of concurrent moves reached",
            );
        };

        let query = match parse_query(ctx, &request.identifier, self.match_absent) {
            Ok(query) => query,
            Err(response) => return response.with_sub_operations(SubOperations::default()),
        };

        let destination = request.destination.trim().to_string();
        let lookup = destination.clone();
        let node = match with_index(&self.index, move |index| index.ae(&lookup)).await {
            Ok(Some(record)) if record.move_destination => RemoteNode::from(record),
            Ok(_) => {
                warn!(%destination, "C-MOVE to unknown destination");
                return failure_without_sub_operations(
                    status::MOVE_DESTINATION_UNKNOWN,
                    format!("unknown move destination '{}'", destination),
                );
            }
            Err(e) => {
                return failure_without_sub_operations(status::UNABLE_TO_PROCESS, e.to_string());
            }
        };

        let instances = match with_index(&self.index, move |index| index.instances_matching(&query)).await
        {
            Ok(instances) => instances,
            Err(e) => {
                warn!("C-MOVE index lookup failed: {}", e);
                return failure_without_sub_operations(status::UNABLE_TO_PROCESS, e.to_string());
            }
        };
        info!(
            message_id = ctx.message_id,
            destination = %node,
            instances = instances.len(),
            "C-MOVE"
        );
        if instances.is_empty() {
            return DimseResponse::success().with_sub_operations(SubOperations::default());
        }

        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let stop = cancel.child_token();
        let forward = Forward {
            scu: self.scu.clone(),
            store: Arc::clone(&self.store),
            node,
            instances,
            originator: (ctx.calling_ae_title().to_string(), ctx.message_id),
            cancel: stop.clone(),
            progress: progress_tx,
        };
        let span = info_span!("move", destination = %destination);
        let task = tokio::spawn(forward.run().instrument(span));

        while let Some(counts) = progress_rx.recv().await {
            let update = DimseResponse::new(DimseStatus::Pending).with_sub_operations(counts);
            if !pending.send(update).await {
                debug!("association closed during C-MOVE, stopping sub-operations");
                stop.cancel();
                break;
            }
        }
        drop(progress_rx);
        match task.await {
            Ok(tally) => tally.into_response(),
            Err(e) => failure_without_sub_operations(status::UNABLE_TO_PROCESS, e.to_string()),
        }
    }
}

/// Outcome of the sub-operations of one C-MOVE
#[derive(Debug, Default)]
struct Tally {
    total: usize,
    completed: usize,
    failed: usize,
    warning: usize,
    failed_uids: Vec<String>,
    cancelled: bool,
    unreachable: Option<String>,
}

fn count(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

impl Tally {
    fn done(&self) -> usize {
        self.completed + self.failed + self.warning
    }

    fn sub_operations(&self) -> SubOperations {
        SubOperations {
            remaining: count(self.total - self.done()),
            completed: count(self.completed),
            failed: count(self.failed),
            warning: count(self.warning),
        }
    }

    fn fail(&mut self, instance: &InstanceRecord) {
        self.failed += 1;
        self.failed_uids.push(instance.sop_instance_uid.clone());
    }

    fn into_response(self) -> DimseResponse {
        let counts = self.sub_operations();
        let response = if let Some(reason) = &self.unreachable {
            DimseResponse::failure(
                status::OUT_OF_RESOURCES_SUB_OPERATIONS,
                format!("destination unreachable: {}", reason),
            )
        } else if self.cancelled {
            DimseResponse::new(DimseStatus::Cancel)
        } else if self.total > 0 && self.failed == self.total {
            DimseResponse::failure(
                status::OUT_OF_RESOURCES_SUB_OPERATIONS,
                "all sub-operations failed",
            )
        } else if self.failed > 0 || self.warning > 0 {
            DimseResponse::new(DimseStatus::Warning(status::SUB_OPERATIONS_WARNING))
        } else {
            DimseResponse::success()
        };
        let response = response.with_sub_operations(counts);

        if self.failed_uids.is_empty() {
            return response;
        }
        let mut identifier = InMemDicomObject::new_empty();
        identifier.put(DataElement::new(
            tags::FAILED_SOP_INSTANCE_UID_LIST,
            VR::UI,
            PrimitiveValue::Strs(self.failed_uids.into()),
        ));
        response.with_identifier(identifier)
    }
}

/// The outbound half of a C-MOVE
struct Forward {
    scu: DimseScu,
    store: Arc<dyn ObjectStore>,
    node: RemoteNode,
    instances: Vec<InstanceRecord>,
    originator: (String, u16),
    cancel: CancellationToken,
    progress: mpsc::Sender<SubOperations>,
}

/// Errors that fail a single sub-operation without losing the association
fn is_instance_error(error: &DimseError) -> bool {
    matches!(
        error,
        DimseError::NoPresentationContext(_)
            | DimseError::NotSupported(_)
            | DimseError::DicomParsing(_)
            | DimseError::DicomEncoding(_)
    )
}

impl Forward {
    /// Proposes every stored SOP class with its stored transfer syntax and
    /// the uncompressed fallbacks
    fn proposals(&self) -> Vec<(String, Vec<String>)> {
        let mut by_class: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for instance in &self.instances {
            let syntaxes = by_class.entry(instance.sop_class_uid.as_str()).or_default();
            if !syntaxes.contains(&instance.transfer_syntax) {
                syntaxes.push(instance.transfer_syntax.clone());
            }
        }
        by_class
            .into_iter()
            .map(|(sop_class_uid, mut syntaxes)| {
                for fallback in sop_class::uncompressed_transfer_syntaxes() {
                    if !syntaxes.contains(&fallback) {
                        syntaxes.push(fallback);
                    }
                }
                (sop_class_uid.to_string(), syntaxes)
            })
            .collect()
    }

    async fn run(self) -> Tally {
        let mut tally = Tally {
            total: self.instances.len(),
            ..Tally::default()
        };

        let mut association = match self.scu.connect(&self.node, &self.proposals()).await {
            Ok(association) => association,
            Err(e) => {
                warn!("cannot open association to {}: {}", self.node, e);
                for instance in &self.instances {
                    tally.fail(instance);
                }
                tally.unreachable = Some(e.to_string());
                return tally;
            }
        };

        let (originator_ae, originator_id) = (self.originator.0.as_str(), self.originator.1);
        let mut lost = None;
        for instance in &self.instances {
            if lost.is_some() {
                tally.fail(instance);
                continue;
            }
            if self.cancel.is_cancelled() {
                info!(done = tally.done(), total = tally.total, "C-MOVE cancelled");
                tally.cancelled = true;
                break;
            }

            let data = match self.store.get(&instance.object_key).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(sop_instance_uid = %instance.sop_instance_uid, "cannot read object: {}", e);
                    tally.fail(instance);
                    let _ = self.progress.send(tally.sub_operations()).await;
                    continue;
                }
            };
            let outcome = association
                .store(
                    &instance.sop_class_uid,
                    &instance.sop_instance_uid,
                    &instance.transfer_syntax,
                    data,
                    Some((originator_ae, originator_id)),
                )
                .await;
            match outcome {
                Ok(outcome) => match outcome.status {
                    DimseStatus::Success => tally.completed += 1,
                    DimseStatus::Warning(_) => tally.warning += 1,
                    other => {
                        debug!(
                            sop_instance_uid = %instance.sop_instance_uid,
                            status = ?other,
                            comment = ?outcome.error_comment,
                            "sub-operation failed"
                        );
                        tally.fail(instance);
                    }
                },
                Err(e) if is_instance_error(&e) => {
                    warn!(sop_instance_uid = %instance.sop_instance_uid, "sub-operation failed: {}", e);
                    tally.fail(instance);
                }
                Err(e) => {
                    warn!("association to {} lost: {}", self.node, e);
                    tally.fail(instance);
                    lost = Some(e);
                }
            }
            if tally.done() < tally.total {
                let _ = self.progress.send(tally.sub_operations()).await;
            }
        }

        if lost.is_none() {
            if let Err(e) = association.release().await {
                debug!("release of association to {} failed: {}", self.node, e);
            }
        }
        info!(
            completed = tally.completed,
            failed = tally.failed,
            warning = tally.warning,
            "C-MOVE sub-operations finished"
        );
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use dimse::{
        AssociationInfo, DimseConfig, DimseScp, PresentationContext, Priority, ServiceRegistry,
        StoreHandler, StoreRequest,
    };
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use crate::config::DuplicatePolicy;
    use crate::index::{AeRecord, InstanceEntry, PatientRecord, SeriesRecord, StudyRecord};
    use crate::storage::{ObjectKey, StorageError, StorageResult};

    const STUDY_UID: &str = "1.2.7";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    /// Every read fails after a short delay
    #[derive(Debug)]
    struct UnreadableStore;

    #[async_trait]
    impl ObjectStore for UnreadableStore {
        async fn put(&self, sop_instance_uid: &str, _data: &[u8]) -> StorageResult<ObjectKey> {
            Ok(ObjectKey::new(sop_instance_uid, "v1"))
        }

        async fn get(&self, key: &ObjectKey) -> StorageResult<Bytes> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err(StorageError::InvalidKey(key.to_string()))
        }

        async fn remove(&self, _key: &ObjectKey) -> StorageResult<()> {
            Ok(())
        }

        async fn exists(&self, _key: &ObjectKey) -> bool {
            false
        }
    }

    struct AcceptAll;

    impl ServiceClass for AcceptAll {
        fn sop_classes(&self) -> Vec<String> {
            vec![CT_IMAGE_STORAGE.to_string()]
        }
    }

    #[async_trait]
    impl StoreHandler for AcceptAll {
        async fn store(&self, _ctx: &RequestContext, _request: StoreRequest) -> DimseResponse {
            DimseResponse::success()
        }
    }


    fn record(uid: &str) -> InstanceRecord {
        InstanceRecord {
            sop_instance_uid: uid.to_string(),
            series_instance_uid: "1.2.1".to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            instance_number: String::new(),
            content_date: String::new(),
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            object_key: crate::storage::ObjectKey::new(uid, "v1"),
            stored_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_tally_statuses() {
        let all_good = Tally {
            total: 2,
            completed: 2,
            ..Tally::default()
        };
        let response = all_good.into_response();
        assert_eq!(response.status, DimseStatus::Success);
        assert!(response.identifier.is_none());

        let mut partial = Tally {
            total: 3,
            completed: 2,
            ..Tally::default()
        };
        partial.fail(&record("1.2.1.3"));
        let response = partial.into_response();
        assert_eq!(response.status, DimseStatus::Warning(status::SUB_OPERATIONS_WARNING));
        let failed = response.identifier.unwrap();
        assert_eq!(
            failed.element(tags::FAILED_SOP_INSTANCE_UID_LIST).unwrap().to_str().unwrap(),
            "1.2.1.3"
        );

        let mut all_failed = Tally {
            total: 1,
            ..Tally::default()
        };
        all_failed.fail(&record("1.2.1.1"));
        let response = all_failed.into_response();
        assert!(response.status.is_failure());
        assert_eq!(response.sub_operations.unwrap().failed, 1);
    }

    #[test]
    fn test_cancelled_tally_reports_remaining() {
        let tally = Tally {
            total: 5,
            completed: 2,
            cancelled: true,
            ..Tally::default()
        };
        let response = tally.into_response();
        assert_eq!(response.status, DimseStatus::Cancel);
        assert_eq!(
            response.sub_operations,
            Some(SubOperations {
                remaining: 3,
                completed: 2,
                failed: 0,
                warning: 0,
            })
        );
    }

    fn entry(n: usize) -> InstanceEntry {
        let series_uid = format!("{}.1", STUDY_UID);
        let sop_uid = format!("{}.1.{}", STUDY_UID, n);
        InstanceEntry {
            patient: PatientRecord {
                patient_id: "PID7".to_string(),
                patient_name: "MOVE^ME".to_string(),
                birth_date: String::new(),
                sex: String::new(),
            },
            study: StudyRecord {
                study_instance_uid: STUDY_UID.to_string(),
                patient_id: "PID7".to_string(),
                study_date: "20240115".to_string(),
                study_time: String::new(),
                accession_number: String::new(),
                study_id: String::new(),
                description: String::new(),
                referring_physician: String::new(),
            },
            series: SeriesRecord {
                series_instance_uid: series_uid.clone(),
                study_instance_uid: STUDY_UID.to_string(),
                modality: "CT".to_string(),
                series_number: String::new(),
                description: String::new(),
                series_date: String::new(),
                series_time: String::new(),
            },
            instance: InstanceRecord {
                series_instance_uid: series_uid,
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                ..record(&sop_uid)
            },
        }
    }

    fn service(dir: &TempDir, destination_port: u16, max_concurrent_moves: usize) -> RetrieveService {
        let index = Arc::new(ArchiveIndex::open(&dir.path().join("index.redb")).unwrap());
        for n in 1..=4 {
            index.insert(&entry(n), DuplicatePolicy::Reject).unwrap();
        }
        index
            .register_ae(&AeRecord {
                ae_title: "VIEWER".to_string(),
                host: "127.0.0.1".to_string(),
                port: destination_port,
                store: true,
                move_destination: true,
                created_at: chrono::Utc::now(),
            })
            .unwrap();
        let scu = DimseScu::new(DimseConfig {
            local_aet: "MUPACS".to_string(),
            artim_timeout_ms: 2000,
            ..DimseConfig::default()
        });
        RetrieveService::new(
            index,
            Arc::new(UnreadableStore),
            scu,
            true,
            sop_class::uncompressed_transfer_syntaxes(),
            max_concurrent_moves,
        )
    }

    fn context() -> RequestContext {
        let presentation_context = PresentationContext {
            id: 1,
            abstract_syntax: sop_class::STUDY_ROOT_MOVE.to_string(),
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
        };
        RequestContext {
            association: Arc::new(AssociationInfo {
                calling_ae_title: "VIEWER".to_string(),
                called_ae_title: "MUPACS".to_string(),
                peer_addr: "127.0.0.1:104".parse().unwrap(),
                peer_max_pdu: 16384,
                local_max_pdu: 16384,
                presentation_contexts: vec![presentation_context.clone()],
                peer_implementation_class_uid: None,
            }),
            presentation_context,
            message_id: 1,
            priority: Priority::Medium,
        }
    }

    fn study_move() -> MoveRequest {
        let mut identifier = InMemDicomObject::new_empty();
        identifier.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ));
        identifier.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(STUDY_UID),
        ));
        MoveRequest {
            destination: "VIEWER".to_string(),
            identifier,
        }
    }

    #[tokio::test]
    async fn test_second_concurrent_move_is_refused() {
        let dir = TempDir::new().unwrap();
        // accepts TCP but never answers the A-ASSOCIATE-RQ
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let service = Arc::new(service(&dir, port, 1));

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(16);
                service
                    .retrieve(&context(), study_move(), PendingResponses::new(tx), CancellationToken::new())
                    .await
            })
        };
        let (_held, _) = tokio::time::timeout(Duration::from_secs(5), silent.accept())
            .await
            .unwrap()
            .unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let refused = service
            .retrieve(&context(), study_move(), PendingResponses::new(tx), CancellationToken::new())
            .await;
        assert_eq!(
            refused.status,
            DimseStatus::Failure(status::OUT_OF_RESOURCES_SUB_OPERATIONS)
        );
        assert_eq!(refused.sub_operations, Some(SubOperations::default()));

        let first = first.await.unwrap();
        assert_eq!(
            first.status,
            DimseStatus::Failure(status::OUT_OF_RESOURCES_SUB_OPERATIONS)
        );
        assert_eq!(first.sub_operations.unwrap().failed, 4);
    }

    #[tokio::test]
    async fn test_closed_requestor_stops_sub_operations() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut registry = ServiceRegistry::new();
        registry.register_store(Arc::new(AcceptAll));
        let destination = DimseScp::new(
            DimseConfig {
                local_aet: "VIEWER".to_string(),
                ..DimseConfig::default()
            },
            registry,
            Arc::new(Vec::<RemoteNode>::new()),
        );
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(destination.serve(listener, shutdown.clone()));

        let service = service(&dir, port, 1);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let response = tokio::time::timeout(
            Duration::from_secs(10),
            service.retrieve(&context(), study_move(), PendingResponses::new(tx), CancellationToken::new()),
        )
        .await
        .expect("C-MOVE kept running after the requestor went away");

        assert_eq!(response.status, DimseStatus::Cancel);
        let counts = response.sub_operations.unwrap();
        assert_eq!(counts.completed, 0);
        assert!(counts.remaining >= 1);
        assert_eq!(counts.failed + counts.remaining, 4);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
