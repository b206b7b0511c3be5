mod common;

use common::{ct_data_set, scu, store_all, Instance, Options, TestArchive};
use dimse::pdu::RejectCause;
use dimse::{sop_class, status, DimseError, DimseStatus, RemoteNode};

#[tokio::test]
async fn echo_succeeds() {
    let archive = TestArchive::start("MUPACS").await;
    let status = scu("ECHOSCU").echo(&archive.node).await.unwrap();
    assert_eq!(status, DimseStatus::Success);
    archive.stop().await;
}

#[tokio::test]
async fn stored_bytes_round_trip() {
    let archive = TestArchive::start("MUPACS").await;
    let data = ct_data_set(&Instance::new("P1", "DOE^JANE", "1.2.1", "1.2.1.1"), "20240115");

    let statuses = store_all(&scu("MODALITY"), &archive.node, &[("1.2.1.1", data.clone())]).await;
    assert_eq!(statuses, vec![DimseStatus::Success]);
    assert_eq!(archive.stored_bytes("1.2.1.1").await.unwrap(), data);

    let stats = archive.pacs.index().statistics().unwrap();
    assert_eq!((stats.patients, stats.studies, stats.series, stats.instances), (1, 1, 1, 1));
    archive.stop().await;
}

#[tokio::test]
async fn duplicate_is_rejected_by_default() {
    let archive = TestArchive::start("MUPACS").await;
    let first = ct_data_set(&Instance::new("P1", "FIRST", "1.2.1", "1.2.1.1"), "20240115");
    let second = ct_data_set(&Instance::new("P1", "SECOND", "1.2.1", "1.2.1.1"), "20240115");

    let statuses = store_all(
        &scu("MODALITY"),
        &archive.node,
        &[("1.2.1.1", first.clone()), ("1.2.1.1", second)],
    )
    .await;
    assert_eq!(
        statuses,
        vec![
            DimseStatus::Success,
            DimseStatus::Failure(status::DUPLICATE_SOP_INSTANCE)
        ]
    );
    assert_eq!(archive.stored_bytes("1.2.1.1").await.unwrap(), first);
    archive.stop().await;
}

#[tokio::test]
async fn duplicate_overwrites_when_configured() {
    let archive = TestArchive::start_with(
        "MUPACS",
        Options {
            duplicate_policy: Some("overwrite"),
            ..Options::default()
        },
    )
    .await;
    let first = ct_data_set(&Instance::new("P1", "FIRST", "1.2.1", "1.2.1.1"), "20240115");
    let second = ct_data_set(&Instance::new("P1", "SECOND", "1.2.1", "1.2.1.1"), "20240115");

    let statuses = store_all(
        &scu("MODALITY"),
        &archive.node,
        &[("1.2.1.1", first), ("1.2.1.1", second.clone())],
    )
    .await;
    assert_eq!(statuses, vec![DimseStatus::Success, DimseStatus::Success]);
    assert_eq!(archive.stored_bytes("1.2.1.1").await.unwrap(), second);
    assert_eq!(archive.pacs.index().statistics().unwrap().instances, 1);
    archive.stop().await;
}

#[tokio::test]
async fn missing_patient_id_fails_validation() {
    let archive = TestArchive::start("MUPACS").await;
    let data = ct_data_set(&Instance::new("", "NOBODY", "1.2.1", "1.2.1.1"), "20240115");

    let statuses = store_all(&scu("MODALITY"), &archive.node, &[("1.2.1.1", data)]).await;
    assert_eq!(
        statuses,
        vec![DimseStatus::Failure(status::DATA_SET_DOES_NOT_MATCH_SOP_CLASS)]
    );
    assert!(archive.pacs.index().instance("1.2.1.1").unwrap().is_none());
    archive.stop().await;
}

#[tokio::test]
async fn unknown_called_ae_is_rejected() {
    let archive = TestArchive::start("MUPACS").await;
    let wrong = RemoteNode::new("NOT_MUPACS", "127.0.0.1", archive.node.port);

    let result = scu("MODALITY")
        .connect(
            &wrong,
            &[(sop_class::VERIFICATION.to_string(), vec![common::EXPLICIT_VR_LE.to_string()])],
        )
        .await;
    match result {
        Err(DimseError::AssociationRejected(reason)) => {
            assert_eq!(reason.cause, RejectCause::CalledAeNotRecognized);
        }
        Err(other) => panic!("expected rejection, got {}", other),
        Ok(_) => panic!("association with wrong called AE was established"),
    }
    archive.stop().await;
}

#[tokio::test]
async fn store_role_is_enforced_for_registered_peers() {
    let archive = TestArchive::start_with(
        "MUPACS",
        Options {
            remotes: "VIEWER@127.0.0.1:11199",
            ..Options::default()
        },
    )
    .await;
    archive
        .pacs
        .index()
        .register_ae(&mupacs::index::AeRecord {
            ae_title: "READONLY".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11198,
            store: false,
            move_destination: true,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
    let data = ct_data_set(&Instance::new("P1", "DOE", "1.2.1", "1.2.1.1"), "20240115");

    let statuses = store_all(&scu("READONLY"), &archive.node, &[("1.2.1.1", data.clone())]).await;
    assert_eq!(statuses, vec![DimseStatus::Failure(status::NOT_AUTHORIZED)]);

    let statuses = store_all(&scu("VIEWER"), &archive.node, &[("1.2.1.1", data)]).await;
    assert_eq!(statuses, vec![DimseStatus::Success]);
    archive.stop().await;
}
