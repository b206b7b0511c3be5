//! Queries over the archive hierarchy and the rows they produce

use dicom_core::header::Header;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::sop_class::InformationModel;
use dimse::QueryLevel;
use thiserror::Error;

use crate::index::matcher::Matcher;
use crate::index::records::{InstanceRecord, PatientRecord, SeriesRecord, StudyRecord};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("identifier has no Query/Retrieve Level")]
    MissingLevel,

    #[error("unknown Query/Retrieve Level '{0}'")]
    InvalidLevel(String),

    #[error("{level} level is not part of the {model:?} information model")]
    LevelNotInModel {
        level: QueryLevel,
        model: InformationModel,
    },

    #[error("invalid matching key {tag}: {source}")]
    InvalidKey {
        tag: Tag,
        #[source]
        source: regex::Error,
    },
}

/// One key of a query: how to match it and how to return it
#[derive(Debug, Clone)]
pub struct QueryKey {
    pub tag: Tag,
    pub vr: VR,
    pub matcher: Matcher,
}

/// A parsed C-FIND/C-MOVE identifier
#[derive(Debug, Clone)]
pub struct IndexQuery {
    level: QueryLevel,
    keys: Vec<QueryKey>,
    match_absent: bool,
}

impl IndexQuery {
    pub fn new(level: QueryLevel) -> Self {
        Self {
            level,
            keys: Vec::new(),
            match_absent: true,
        }
    }

    pub fn with_key(mut self, tag: Tag, vr: VR, value: &str) -> Result<Self, QueryError> {
        let matcher =
            Matcher::new(vr, value).map_err(|source| QueryError::InvalidKey { tag, source })?;
        self.keys.retain(|k| k.tag != tag);
        self.keys.push(QueryKey { tag, vr, matcher });
        Ok(self)
    }

    /// Whether a key the archive holds no value for still matches
    pub fn match_absent(mut self, lenient: bool) -> Self {
        self.match_absent = lenient;
        self
    }

    /// Parses an identifier received under the given information model
    pub fn from_identifier(
        identifier: &InMemDicomObject,
        model: InformationModel,
    ) -> Result<Self, QueryError> {
        let level = identifier
            .element(tags::QUERY_RETRIEVE_LEVEL)
            .ok()
            .and_then(|e| e.to_str().ok().map(|s| s.into_owned()))
            .ok_or(QueryError::MissingLevel)?;
        let level: QueryLevel = level
            .parse()
            .map_err(|_| QueryError::InvalidLevel(level.clone()))?;
        if model == InformationModel::StudyRoot && level == QueryLevel::Patient {
            return Err(QueryError::LevelNotInModel { level, model });
        }

        let mut query = IndexQuery::new(level);
        for element in identifier.iter() {
            let tag = element.tag();
            if tag == tags::QUERY_RETRIEVE_LEVEL
                || tag == tags::SPECIFIC_CHARACTER_SET
                || tag.group() == 0x0002
                || element.vr() == VR::SQ
            {
                continue;
            }
            let value = element.to_str().map(|s| s.into_owned()).unwrap_or_default();
            query = query.with_key(tag, element.vr(), &value)?;
        }
        Ok(query)
    }

    pub fn level(&self) -> QueryLevel {
        self.level
    }

    pub fn keys(&self) -> &[QueryKey] {
        &self.keys
    }

    pub fn matcher(&self, tag: Tag) -> Option<&Matcher> {
        self.keys.iter().find(|k| k.tag == tag).map(|k| &k.matcher)
    }

    pub(crate) fn requests(&self, tag: Tag) -> bool {
        self.keys.iter().any(|k| k.tag == tag)
    }

    pub fn matches(&self, row: &MatchRow) -> bool {
        self.keys.iter().all(|key| {
            if key.matcher.is_universal() {
                return true;
            }
            match row.attribute(key.tag) {
                Some(value) if !value.is_empty() => key.matcher.matches(&value),
                _ => self.match_absent,
            }
        })
    }
}

/// Values computed from the hierarchy rather than stored
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Derived {
    pub modalities_in_study: Option<String>,
    pub patient_related_studies: Option<usize>,
    pub study_related_series: Option<usize>,
    pub study_related_instances: Option<usize>,
    pub series_related_instances: Option<usize>,
}

/// One entity at the query level together with its ancestors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRow {
    pub level: QueryLevel,
    pub patient: PatientRecord,
    pub study: Option<StudyRecord>,
    pub series: Option<SeriesRecord>,
    pub instance: Option<InstanceRecord>,
    pub derived: Derived,
}

impl MatchRow {
    /// Value of an attribute for this row, `None` when the archive does not track it here
    pub fn attribute(&self, tag: Tag) -> Option<String> {
        let patient = &self.patient;
        let study = self.study.as_ref();
        let series = self.series.as_ref();
        let instance = self.instance.as_ref();
        let count = |n: Option<usize>| n.map(|n| n.to_string());

        match tag {
            tags::PATIENT_ID => Some(patient.patient_id.clone()),
            tags::PATIENT_NAME => Some(patient.patient_name.clone()),
            tags::PATIENT_BIRTH_DATE => Some(patient.birth_date.clone()),
            tags::PATIENT_SEX => Some(patient.sex.clone()),
            tags::NUMBER_OF_PATIENT_RELATED_STUDIES => count(self.derived.patient_related_studies),

            tags::STUDY_INSTANCE_UID => study.map(|s| s.study_instance_uid.clone()),
            tags::STUDY_DATE => study.map(|s| s.study_date.clone()),
            tags::STUDY_TIME => study.map(|s| s.study_time.clone()),
            tags::ACCESSION_NUMBER => study.map(|s| s.accession_number.clone()),
            tags::STUDY_ID => study.map(|s| s.study_id.clone()),
            tags::STUDY_DESCRIPTION => study.map(|s| s.description.clone()),
            tags::REFERRING_PHYSICIAN_NAME => study.map(|s| s.referring_physician.clone()),
            tags::MODALITIES_IN_STUDY => self.derived.modalities_in_study.clone(),
            tags::NUMBER_OF_STUDY_RELATED_SERIES => count(self.derived.study_related_series),
            tags::NUMBER_OF_STUDY_RELATED_INSTANCES => count(self.derived.study_related_instances),

            tags::SERIES_INSTANCE_UID => series.map(|s| s.series_instance_uid.clone()),
            tags::MODALITY => series.map(|s| s.modality.clone()),
            tags::SERIES_NUMBER => series.map(|s| s.series_number.clone()),
            tags::SERIES_DESCRIPTION => series.map(|s| s.description.clone()),
            tags::SERIES_DATE => series.map(|s| s.series_date.clone()),
            tags::SERIES_TIME => series.map(|s| s.series_time.clone()),
            tags::NUMBER_OF_SERIES_RELATED_INSTANCES => count(self.derived.series_related_instances),

            tags::SOP_INSTANCE_UID => instance.map(|i| i.sop_instance_uid.clone()),
            tags::SOP_CLASS_UID => instance.map(|i| i.sop_class_uid.clone()),
            tags::INSTANCE_NUMBER => instance.map(|i| i.instance_number.clone()),
            tags::CONTENT_DATE => instance.map(|i| i.content_date.clone()),
            _ => None,
        }
    }

    /// Builds the response identifier holding exactly the requested keys
    /// plus the level and its unique key
    pub fn to_identifier(&self, query: &IndexQuery) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.level.to_string()),
        ));

        let (unique_tag, unique_vr) = unique_key(self.level);
        if !query.requests(unique_tag) {
            self.put_attribute(&mut obj, unique_tag, unique_vr);
        }
        for key in query.keys() {
            self.put_attribute(&mut obj, key.tag, key.vr);
        }
        obj
    }

    fn put_attribute(&self, obj: &mut InMemDicomObject, tag: Tag, vr: VR) {
        let value = match self.attribute(tag) {
            Some(value) if !value.is_empty() && is_text(vr) => PrimitiveValue::from(value),
            _ => PrimitiveValue::Empty,
        };
        obj.put(DataElement::new(tag, vr, value));
    }
}

pub fn unique_key(level: QueryLevel) -> (Tag, VR) {
    match level {
        QueryLevel::Patient => (tags::PATIENT_ID, VR::LO),
        QueryLevel::Study => (tags::STUDY_INSTANCE_UID, VR::UI),
        QueryLevel::Series => (tags::SERIES_INSTANCE_UID, VR::UI),
        QueryLevel::Image => (tags::SOP_INSTANCE_UID, VR::UI),
    }
}

fn is_text(vr: VR) -> bool {
    matches!(
        vr,
        VR::AE
            | VR::AS
            | VR::CS
            | VR::DA
            | VR::DS
            | VR::DT
            | VR::IS
            | VR::LO
            | VR::LT
            | VR::PN
            | VR::SH
            | VR::ST
            | VR::TM
            | VR::UC
            | VR::UI
            | VR::UR
            | VR::UT
    )
}
