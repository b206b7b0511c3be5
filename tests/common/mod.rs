#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::{DimseConfig, DimseScu, DimseStatus, RemoteNode};
use mupacs::config::Config;
use mupacs::Pacs;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Settings that differ between test archives
#[derive(Default)]
pub struct Options<'a> {
    /// `reject` or `overwrite`
    pub duplicate_policy: Option<&'a str>,
    /// Compact peer list, `AET@host:port;...`
    pub remotes: &'a str,
    pub max_concurrent_moves: Option<u32>,
}

/// An archive serving on an ephemeral local port
pub struct TestArchive {
    pub dir: TempDir,
    pub pacs: Arc<Pacs>,
    pub node: RemoteNode,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestArchive {
    pub async fn start(ae_title: &str) -> Self {
        Self::start_with(ae_title, Options::default()).await
    }

    pub async fn start_with(ae_title: &str, options: Options<'_>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let toml = format!(
            r#"
            remotes = "{remotes}"

            [archive]
            storage_dir = "{storage}"
            duplicate_policy = "{policy}"

            [dimse]
            local_aet = "{ae_title}"
            bind_addr = "127.0.0.1"
            port = {port}
            association_timeout_ms = 10000
            artim_timeout_ms = 5000
            max_concurrent_moves = {moves}
            "#,
            remotes = options.remotes,
            storage = toml_path(&dir.path().join("archive")),
            policy = options.duplicate_policy.unwrap_or("reject"),
            moves = options.max_concurrent_moves.unwrap_or(2),
        );
        let config: Config = toml::from_str(&toml).expect("TOML parse error");
        config.validate().expect("valid config");

        let pacs = Arc::new(Pacs::open(config).expect("open archive"));
        let shutdown = CancellationToken::new();
        let task = {
            let pacs = Arc::clone(&pacs);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                pacs.serve(listener, shutdown).await.expect("serve");
            })
        };

        Self {
            dir,
            pacs,
            node: RemoteNode::new(ae_title, "127.0.0.1", port),
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }

    /// Bytes the object store holds for an archived instance
    pub async fn stored_bytes(&self, sop_instance_uid: &str) -> Option<Bytes> {
        let record = self.pacs.index().instance(sop_instance_uid).unwrap()?;
        Some(self.pacs.object_store().get(&record.object_key).await.unwrap())
    }
}

fn toml_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

pub fn scu(ae_title: &str) -> DimseScu {
    DimseScu::new(DimseConfig {
        local_aet: ae_title.to_string(),
        connect_timeout_ms: 5000,
        association_timeout_ms: 10000,
        artim_timeout_ms: 5000,
        ..DimseConfig::default()
    })
}

/// Identifiers of one CT instance
pub struct Instance<'a> {
    pub patient_id: &'a str,
    pub patient_name: &'a str,
    pub study_uid: &'a str,
    pub series_uid: &'a str,
    pub sop_uid: &'a str,
}

impl<'a> Instance<'a> {
    /// One instance in a single-series study
    pub fn new(patient_id: &'a str, patient_name: &'a str, study_uid: &'a str, sop_uid: &'a str) -> Self {
        Self {
            patient_id,
            patient_name,
            study_uid,
            series_uid: study_uid,
            sop_uid,
        }
    }
}

fn put(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

/// Explicit VR little endian data set for `instance`
pub fn ct_data_set(instance: &Instance, study_date: &str) -> Bytes {
    let mut obj = InMemDicomObject::new_empty();
    put(&mut obj, tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE);
    put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, instance.sop_uid);
    put(&mut obj, tags::STUDY_DATE, VR::DA, study_date);
    put(&mut obj, tags::MODALITY, VR::CS, "CT");
    put(&mut obj, tags::PATIENT_NAME, VR::PN, instance.patient_name);
    put(&mut obj, tags::PATIENT_ID, VR::LO, instance.patient_id);
    put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, instance.study_uid);
    put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, instance.series_uid);
    put(&mut obj, tags::INSTANCE_NUMBER, VR::IS, "1");
    dimse::message::write_data_set(&obj, EXPLICIT_VR_LE).unwrap()
}

/// Stores data sets over one association and returns each response status
pub async fn store_all(scu: &DimseScu, node: &RemoteNode, items: &[(&str, Bytes)]) -> Vec<DimseStatus> {
    let mut association = scu
        .connect(
            node,
            &[(CT_IMAGE_STORAGE.to_string(), vec![EXPLICIT_VR_LE.to_string()])],
        )
        .await
        .expect("associate");
    let mut statuses = Vec::new();
    for (sop_uid, data) in items {
        let outcome = association
            .store(CT_IMAGE_STORAGE, sop_uid, EXPLICIT_VR_LE, data.clone(), None)
            .await
            .expect("C-STORE");
        statuses.push(outcome.status);
    }
    association.release().await.expect("release");
    statuses
}

/// Stores one instance per entry, each with its own study
pub async fn populate(archive: &TestArchive, instances: &[Instance<'_>]) {
    let items: Vec<(&str, Bytes)> = instances
        .iter()
        .map(|i| (i.sop_uid, ct_data_set(i, "20240115")))
        .collect();
    let statuses = store_all(&scu("MODALITY"), &archive.node, &items).await;
    assert!(statuses.iter().all(|s| *s == DimseStatus::Success), "{:?}", statuses);
}
