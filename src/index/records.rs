//! Records persisted by the archive index and their extraction from data sets

use chrono::{DateTime, Utc};
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::ObjectKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient_name: String,
    pub birth_date: String,
    pub sex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub study_date: String,
    pub study_time: String,
    pub accession_number: String,
    pub study_id: String,
    pub description: String,
    pub referring_physician: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub modality: String,
    pub series_number: String,
    pub description: String,
    pub series_date: String,
    pub series_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_class_uid: String,
    pub instance_number: String,
    pub content_date: String,
    /// Transfer syntax of the stored bytes
    pub transfer_syntax: String,
    pub object_key: ObjectKey,
    pub stored_at: DateTime<Utc>,
}

/// Everything the index learns from one stored instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEntry {
    pub patient: PatientRecord,
    pub study: StudyRecord,
    pub series: SeriesRecord,
    pub instance: InstanceRecord,
}

/// Peer registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeRecord {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    pub store: bool,
    pub move_destination: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&dimse::RemoteNode> for AeRecord {
    fn from(node: &dimse::RemoteNode) -> Self {
        Self {
            ae_title: node.ae_title.clone(),
            host: node.host.clone(),
            port: node.port,
            store: node.store,
            move_destination: node.move_destination,
            created_at: Utc::now(),
        }
    }
}

impl From<AeRecord> for dimse::RemoteNode {
    fn from(record: AeRecord) -> Self {
        dimse::RemoteNode::new(record.ae_title, record.host, record.port)
            .with_roles(record.store, record.move_destination)
    }
}

/// Entity counts of the whole archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStatistics {
    pub patients: u64,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
    pub application_entities: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("missing mandatory attribute {name} {tag}")]
pub struct MissingAttribute {
    pub name: &'static str,
    pub tag: Tag,
}

/// Indexed attributes of a data set after normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetAttributes {
    patient: PatientRecord,
    study: StudyRecord,
    series: SeriesRecord,
    sop_instance_uid: String,
    sop_class_uid: String,
    instance_number: String,
    content_date: String,
    /// Elements whose value was changed by normalization
    coerced: Vec<(Tag, String)>,
}

#[derive(Clone, Copy)]
enum Form {
    Text,
    Date,
    Time,
}

impl DatasetAttributes {
    /// Reads and normalizes the indexed attributes, failing on missing identifiers
    pub fn read(obj: &InMemDicomObject) -> Result<Self, MissingAttribute> {
        let mut coerced = Vec::new();
        let mut get = |tag: Tag, form: Form| -> String {
            let Some(raw) = obj
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.into_owned())
            else {
                return String::new();
            };
            let value = normalize(&raw, form);
            if value != raw.trim_end_matches(|c: char| c.is_whitespace() || c == '\0') {
                coerced.push((tag, value.clone()));
            }
            value
        };

        let patient = PatientRecord {
            patient_id: get(tags::PATIENT_ID, Form::Text),
            patient_name: get(tags::PATIENT_NAME, Form::Text),
            birth_date: get(tags::PATIENT_BIRTH_DATE, Form::Date),
            sex: get(tags::PATIENT_SEX, Form::Text),
        };
        let study = StudyRecord {
            study_instance_uid: get(tags::STUDY_INSTANCE_UID, Form::Text),
            patient_id: patient.patient_id.clone(),
            study_date: get(tags::STUDY_DATE, Form::Date),
            study_time: get(tags::STUDY_TIME, Form::Time),
            accession_number: get(tags::ACCESSION_NUMBER, Form::Text),
            study_id: get(tags::STUDY_ID, Form::Text),
            description: get(tags::STUDY_DESCRIPTION, Form::Text),
            referring_physician: get(tags::REFERRING_PHYSICIAN_NAME, Form::Text),
        };
        let series = SeriesRecord {
            series_instance_uid: get(tags::SERIES_INSTANCE_UID, Form::Text),
            study_instance_uid: study.study_instance_uid.clone(),
            modality: get(tags::MODALITY, Form::Text),
            series_number: get(tags::SERIES_NUMBER, Form::Text),
            description: get(tags::SERIES_DESCRIPTION, Form::Text),
            series_date: get(tags::SERIES_DATE, Form::Date),
            series_time: get(tags::SERIES_TIME, Form::Time),
        };
        let sop_instance_uid = get(tags::SOP_INSTANCE_UID, Form::Text);
        let sop_class_uid = get(tags::SOP_CLASS_UID, Form::Text);
        let instance_number = get(tags::INSTANCE_NUMBER, Form::Text);
        let content_date = get(tags::CONTENT_DATE, Form::Date);

        let attributes = Self {
            patient,
            study,
            series,
            sop_instance_uid,
            sop_class_uid,
            instance_number,
            content_date,
            coerced,
        };
        attributes.check_mandatory()?;
        Ok(attributes)
    }

    fn check_mandatory(&self) -> Result<(), MissingAttribute> {
        let required = [
            ("SOPInstanceUID", tags::SOP_INSTANCE_UID, &self.sop_instance_uid),
            ("SOPClassUID", tags::SOP_CLASS_UID, &self.sop_class_uid),
            ("StudyInstanceUID", tags::STUDY_INSTANCE_UID, &self.study.study_instance_uid),
            ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID, &self.series.series_instance_uid),
            ("PatientID", tags::PATIENT_ID, &self.patient.patient_id),
        ];
        match required.iter().find(|(_, _, value)| value.is_empty()) {
            Some((name, tag, _)) => Err(MissingAttribute {
                name: *name,
                tag: *tag,
            }),
            None => Ok(()),
        }
    }

    pub fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    pub fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    pub fn study_instance_uid(&self) -> &str {
        &self.study.study_instance_uid
    }

    pub fn is_coerced(&self) -> bool {
        !self.coerced.is_empty()
    }

    /// Writes the normalized values back into the data set
    pub fn apply_coercions(&self, obj: &mut InMemDicomObject) {
        for (tag, value) in &self.coerced {
            let Ok(element) = obj.element(*tag) else {
                continue;
            };
            let vr = element.vr();
            obj.put(DataElement::new(*tag, vr, PrimitiveValue::from(value.as_str())));
        }
    }

    pub fn into_entry(self, transfer_syntax: &str, object_key: ObjectKey) -> InstanceEntry {
        InstanceEntry {
            instance: InstanceRecord {
                sop_instance_uid: self.sop_instance_uid,
                series_instance_uid: self.series.series_instance_uid.clone(),
                sop_class_uid: self.sop_class_uid,
                instance_number: self.instance_number,
                content_date: self.content_date,
                transfer_syntax: transfer_syntax.to_string(),
                object_key,
                stored_at: Utc::now(),
            },
            patient: self.patient,
            study: self.study,
            series: self.series,
        }
    }
}

/// Trims padding and rewrites legacy `YYYY.MM.DD` dates and `HH:MM:SS` times
fn normalize(raw: &str, form: Form) -> String {
    let value = raw.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    match form {
        Form::Text => value.to_string(),
        Form::Date => {
            let legacy = value.len() == 10
                && value.as_bytes()[4] == b'.'
                && value.as_bytes()[7] == b'.';
            if legacy {
                value.replace('.', "")
            } else {
                value.to_string()
            }
        }
        Form::Time => {
            if value.contains(':') {
                value.replace(':', "")
            } else {
                value.to_string()
            }
        }
    }
}
