use super::*;
use crate::storage::ObjectKey;
use chrono::Utc;
use dicom_core::VR;
use dicom_dictionary_std::tags;
use tempfile::TempDir;

fn open_index() -> (TempDir, ArchiveIndex) {
    let temp_dir = TempDir::new().unwrap();
    let index = ArchiveIndex::open(&temp_dir.path().join("index.redb")).unwrap();
    (temp_dir, index)
}

fn entry(patient: &str, study: &str, series: &str, sop: &str) -> InstanceEntry {
    InstanceEntry {
        patient: PatientRecord {
            patient_id: patient.to_string(),
            patient_name: format!("{}^TEST", patient),
            birth_date: "19700101".to_string(),
            sex: "O".to_string(),
        },
        study: StudyRecord {
            study_instance_uid: study.to_string(),
            patient_id: patient.to_string(),
            study_date: "20240115".to_string(),
            study_time: "101500".to_string(),
            accession_number: "ACC1".to_string(),
            study_id: "1".to_string(),
            description: "CHEST".to_string(),
            referring_physician: String::new(),
        },
        series: SeriesRecord {
            series_instance_uid: series.to_string(),
            study_instance_uid: study.to_string(),
            modality: "CT".to_string(),
            series_number: "1".to_string(),
            description: String::new(),
            series_date: String::new(),
            series_time: String::new(),
        },
        instance: InstanceRecord {
            sop_instance_uid: sop.to_string(),
            series_instance_uid: series.to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            instance_number: "1".to_string(),
            content_date: String::new(),
            transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            object_key: ObjectKey::new(sop, "v1"),
            stored_at: Utc::now(),
        },
    }
}

#[test]
fn test_insert_creates_hierarchy() {
    let (_dir, index) = open_index();
    let outcome = index
        .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.1"), DuplicatePolicy::Reject)
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Created);
    index
        .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.2"), DuplicatePolicy::Reject)
        .unwrap();

    assert_eq!(index.patient("P1").unwrap().unwrap().patient_name, "P1^TEST");
    assert_eq!(index.studies_of_patient("P1").unwrap().len(), 1);
    assert_eq!(index.series_of_study("1.1").unwrap().len(), 1);
    assert_eq!(index.instances_of_series("1.1.1").unwrap().len(), 2);

    let stats = index.statistics().unwrap();
    assert_eq!(stats.patients, 1);
    assert_eq!(stats.studies, 1);
    assert_eq!(stats.series, 1);
    assert_eq!(stats.instances, 2);
}

#[test]
fn test_duplicate_policies() {
    let (_dir, index) = open_index();
    let first = entry("P1", "1.1", "1.1.1", "1.1.1.1");
    index.insert(&first, DuplicatePolicy::Reject).unwrap();

    let err = index.insert(&first, DuplicatePolicy::Reject).unwrap_err();
    assert!(matches!(err, IndexError::Duplicate(uid) if uid == "1.1.1.1"));

    let mut second = first.clone();
    second.instance.object_key = ObjectKey::new("1.1.1.1", "v2");
    match index.insert(&second, DuplicatePolicy::Overwrite).unwrap() {
        InsertOutcome::Replaced(previous) => assert_eq!(previous.object_key.as_str(), "1.1.1.1/v1"),
        other => panic!("expected replacement, got {:?}", other),
    }
    assert_eq!(
        index.instance("1.1.1.1").unwrap().unwrap().object_key.as_str(),
        "1.1.1.1/v2"
    );
    assert_eq!(index.statistics().unwrap().instances, 1);
}

#[test]
fn test_hierarchy_conflicts_write_nothing() {
    let (_dir, index) = open_index();
    index
        .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.1"), DuplicatePolicy::Reject)
        .unwrap();

    let err = index
        .insert(&entry("P2", "1.1", "1.1.2", "1.1.2.1"), DuplicatePolicy::Reject)
        .unwrap_err();
    assert!(matches!(err, IndexError::Conflict(_)));

    let err = index
        .insert(&entry("P1", "1.2", "1.1.1", "1.1.1.9"), DuplicatePolicy::Reject)
        .unwrap_err();
    assert!(matches!(err, IndexError::Conflict(_)));

    assert!(index.patient("P2").unwrap().is_none());
    assert!(index.study("1.2").unwrap().is_none());
    assert!(index.instance("1.1.2.1").unwrap().is_none());
    assert_eq!(index.statistics().unwrap().instances, 1);
}

#[test]
fn test_overwrite_into_other_series_prunes_empty_parents() {
    let (_dir, index) = open_index();
    index
        .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.1"), DuplicatePolicy::Reject)
        .unwrap();
    index
        .insert(&entry("P2", "2.1", "2.1.1", "1.1.1.1"), DuplicatePolicy::Overwrite)
        .unwrap();

    assert!(index.series("1.1.1").unwrap().is_none());
    assert!(index.study("1.1").unwrap().is_none());
    assert!(index.patient("P1").unwrap().is_none());
    assert_eq!(index.instances_of_series("2.1.1").unwrap().len(), 1);
    assert_eq!(index.statistics().unwrap().patients, 1);
}

#[test]
fn test_find_by_level_and_keys() {
    let (_dir, index) = open_index();
    index
        .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.1"), DuplicatePolicy::Reject)
        .unwrap();
    index
        .insert(&entry("P1", "1.2", "1.2.1", "1.2.1.1"), DuplicatePolicy::Reject)
        .unwrap();
    index
        .insert(&entry("P2", "2.1", "2.1.1", "2.1.1.1"), DuplicatePolicy::Reject)
        .unwrap();

    let all_studies = index.find(&IndexQuery::new(QueryLevel::Study)).unwrap();
    let uids: Vec<_> = all_studies
        .iter()
        .map(|row| row.study.as_ref().unwrap().study_instance_uid.as_str())
        .collect();
    assert_eq!(uids, vec!["1.1", "1.2", "2.1"]);

    let query = IndexQuery::new(QueryLevel::Study)
        .with_key(tags::PATIENT_ID, VR::LO, "P1")
        .unwrap();
    assert_eq!(index.find(&query).unwrap().len(), 2);

    let query = IndexQuery::new(QueryLevel::Patient)
        .with_key(tags::PATIENT_NAME, VR::PN, "p2*")
        .unwrap();
    let rows = index.find(&query).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].patient.patient_id, "P2");

    let query = IndexQuery::new(QueryLevel::Image)
        .with_key(tags::SOP_INSTANCE_UID, VR::UI, "1.2.1.1\\2.1.1.1")
        .unwrap();
    assert_eq!(index.find(&query).unwrap().len(), 2);

    let query = IndexQuery::new(QueryLevel::Study)
        .with_key(tags::STUDY_DATE, VR::DA, "20240101-20240131")
        .unwrap();
    assert_eq!(index.find(&query).unwrap().len(), 3);

    let query = IndexQuery::new(QueryLevel::Study)
        .with_key(tags::STUDY_DATE, VR::DA, "-20231231")
        .unwrap();
    assert!(index.find(&query).unwrap().is_empty());
}

#[test]
fn test_find_computes_requested_counts() {
    let (_dir, index) = open_index();
    index
        .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.1"), DuplicatePolicy::Reject)
        .unwrap();
    let mut mr = entry("P1", "1.1", "1.1.2", "1.1.2.1");
    mr.series.modality = "MR".to_string();
    index.insert(&mr, DuplicatePolicy::Reject).unwrap();
    index
        .insert(&entry("P1", "1.1", "1.1.2", "1.1.2.2"), DuplicatePolicy::Reject)
        .unwrap();

    let query = IndexQuery::new(QueryLevel::Study)
        .with_key(tags::MODALITIES_IN_STUDY, VR::CS, "")
        .unwrap()
        .with_key(tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS, "")
        .unwrap()
        .with_key(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, "")
        .unwrap();
    let rows = index.find(&query).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].derived.modalities_in_study.as_deref(), Some("CT\\MR"));
    assert_eq!(rows[0].derived.study_related_series, Some(2));
    assert_eq!(rows[0].derived.study_related_instances, Some(3));

    let plain = index.find(&IndexQuery::new(QueryLevel::Study)).unwrap();
    assert_eq!(plain[0].derived, Derived::default());
}

#[test]
fn test_instances_matching_expands_levels() {
    let (_dir, index) = open_index();
    for sop in ["1.1.1.1", "1.1.1.2"] {
        index
            .insert(&entry("P1", "1.1", "1.1.1", sop), DuplicatePolicy::Reject)
            .unwrap();
    }
    index
        .insert(&entry("P1", "1.2", "1.2.1", "1.2.1.1"), DuplicatePolicy::Reject)
        .unwrap();

    let study = IndexQuery::new(QueryLevel::Study)
        .with_key(tags::STUDY_INSTANCE_UID, VR::UI, "1.1")
        .unwrap();
    assert_eq!(index.instances_matching(&study).unwrap().len(), 2);

    let patient = IndexQuery::new(QueryLevel::Patient)
        .with_key(tags::PATIENT_ID, VR::LO, "P1")
        .unwrap();
    let uids: Vec<_> = index
        .instances_matching(&patient)
        .unwrap()
        .into_iter()
        .map(|i| i.sop_instance_uid)
        .collect();
    assert_eq!(uids, vec!["1.1.1.1", "1.1.1.2", "1.2.1.1"]);

    let none = IndexQuery::new(QueryLevel::Series)
        .with_key(tags::SERIES_INSTANCE_UID, VR::UI, "9.9")
        .unwrap();
    assert!(index.instances_matching(&none).unwrap().is_empty());
}

#[test]
fn test_ae_registry_seeding() {
    let (_dir, index) = open_index();
    let nodes = vec![
        RemoteNode::new("VIEWER", "10.0.0.5", 104),
        RemoteNode::new("MODALITY", "10.0.0.6", 104).with_roles(true, false),
    ];
    assert_eq!(index.seed_aes(&nodes).unwrap(), (2, 0));

    let changed = vec![RemoteNode::new("VIEWER", "10.0.0.99", 104)];
    assert_eq!(index.seed_aes(&changed).unwrap(), (0, 1));
    assert_eq!(index.ae("VIEWER").unwrap().unwrap().host, "10.0.0.5");

    let node = index.lookup("MODALITY").unwrap();
    assert!(!node.move_destination);
    assert!(index.lookup("UNKNOWN").is_none());
    assert_eq!(index.list_aes().unwrap().len(), 2);
}

#[test]
fn test_index_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("index.redb");
    {
        let index = ArchiveIndex::open(&path).unwrap();
        index
            .insert(&entry("P1", "1.1", "1.1.1", "1.1.1.1"), DuplicatePolicy::Reject)
            .unwrap();
    }
    let index = ArchiveIndex::open(&path).unwrap();
    assert!(index.instance("1.1.1.1").unwrap().is_some());
}
