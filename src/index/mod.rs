//! Durable archive index: the Patient/Study/Series/Instance hierarchy and the
//! AE title registry, stored in redb.
//!
//! Entity tables map a key (Patient ID or UID) to the JSON-encoded record.
//! Children are found through link tables keyed `parent\child`; records only
//! hold their parent's key.

pub mod matcher;
pub mod query;
pub mod records;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use dimse::{PeerRegistry, QueryLevel, RemoteNode};
use redb::{Database, ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::DuplicatePolicy;
pub use matcher::Matcher;
pub use query::{Derived, IndexQuery, MatchRow, QueryError};
pub use records::{
    AeRecord, DatasetAttributes, IndexStatistics, InstanceEntry, InstanceRecord, MissingAttribute,
    PatientRecord, SeriesRecord, StudyRecord,
};

const PATIENTS: TableDefinition<&str, &str> = TableDefinition::new("patients");
const STUDIES: TableDefinition<&str, &str> = TableDefinition::new("studies");
const SERIES: TableDefinition<&str, &str> = TableDefinition::new("series");
const INSTANCES: TableDefinition<&str, &str> = TableDefinition::new("instances");
const STUDIES_BY_PATIENT: TableDefinition<&str, &str> = TableDefinition::new("studies_by_patient");
const SERIES_BY_STUDY: TableDefinition<&str, &str> = TableDefinition::new("series_by_study");
const INSTANCES_BY_SERIES: TableDefinition<&str, &str> =
    TableDefinition::new("instances_by_series");
const AE_TITLES: TableDefinition<&str, &str> = TableDefinition::new("ae_titles");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Database(#[from] redb::Error),

    #[error("failed to prepare index directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode index record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SOP Instance {0} is already archived")]
    Duplicate(String),

    #[error("hierarchy conflict: {0}")]
    Conflict(String),

    #[error("index task failed: {0}")]
    Task(String),
}

macro_rules! from_redb {
    ($($ty:ty),*) => {
        $(impl From<$ty> for IndexError {
            fn from(e: $ty) -> Self {
                IndexError::Database(e.into())
            }
        })*
    };
}

from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

pub type IndexResult<T> = Result<T, IndexError>;

/// What an insert did to the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    /// The previous version of the instance, now unreferenced
    Replaced(InstanceRecord),
}

/// Hierarchical archive index
pub struct ArchiveIndex {
    db: Database,
}

impl std::fmt::Debug for ArchiveIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveIndex").finish_non_exhaustive()
    }
}

fn link(parent: &str, child: &str) -> String {
    format!("{}\\{}", parent, child)
}

/// Key range holding every `parent\child` link of one parent
fn link_range(parent: &str) -> (String, String) {
    // ']' sorts directly after '\'
    (format!("{}\\", parent), format!("{}]", parent))
}

fn get_json<T, R>(table: &R, key: &str) -> IndexResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static str>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
        None => Ok(None),
    }
}

fn all_json<T, R>(table: &R) -> IndexResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static str>,
{
    let mut records = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        records.push(serde_json::from_str(value.value())?);
    }
    Ok(records)
}

/// Child keys of `parent` in key order
fn children<R>(links: &R, parent: &str) -> IndexResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static str>,
{
    let (start, end) = link_range(parent);
    let mut keys = Vec::new();
    for entry in links.range(start.as_str()..end.as_str())? {
        let (_, child) = entry?;
        keys.push(child.value().to_string());
    }
    Ok(keys)
}

impl ArchiveIndex {
    /// Open or create the index database
    pub fn open(db_path: &Path) -> IndexResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(db_path)?;

        let write_txn = db.begin_write()?;
        for table in [
            PATIENTS,
            STUDIES,
            SERIES,
            INSTANCES,
            STUDIES_BY_PATIENT,
            SERIES_BY_STUDY,
            INSTANCES_BY_SERIES,
            AE_TITLES,
        ] {
            write_txn.open_table(table)?;
        }
        write_txn.commit()?;

        tracing::info!("Archive index opened at {}", db_path.display());
        Ok(Self { db })
    }

    /// Records one instance and any missing ancestors in a single transaction
    ///
    /// Ancestors that already exist are kept as they are; a study or series
    /// claimed by a different parent is a conflict and nothing is written.
    pub fn insert(&self, entry: &InstanceEntry, policy: DuplicatePolicy) -> IndexResult<InsertOutcome> {
        let patient_id = entry.patient.patient_id.as_str();
        let study_uid = entry.study.study_instance_uid.as_str();
        let series_uid = entry.series.series_instance_uid.as_str();
        let sop_uid = entry.instance.sop_instance_uid.as_str();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut patients = write_txn.open_table(PATIENTS)?;
            let mut studies = write_txn.open_table(STUDIES)?;
            let mut series = write_txn.open_table(SERIES)?;
            let mut instances = write_txn.open_table(INSTANCES)?;
            let mut studies_by_patient = write_txn.open_table(STUDIES_BY_PATIENT)?;
            let mut series_by_study = write_txn.open_table(SERIES_BY_STUDY)?;
            let mut instances_by_series = write_txn.open_table(INSTANCES_BY_SERIES)?;

            let previous: Option<InstanceRecord> = get_json(&instances, sop_uid)?;
            if previous.is_some() && policy == DuplicatePolicy::Reject {
                return Err(IndexError::Duplicate(sop_uid.to_string()));
            }

            match get_json::<StudyRecord, _>(&studies, study_uid)? {
                Some(existing) if existing.patient_id != patient_id => {
                    return Err(IndexError::Conflict(format!(
                        "study {} belongs to patient '{}', not '{}'",
                        study_uid, existing.patient_id, patient_id
                    )));
                }
                _ => {}
            }
            match get_json::<SeriesRecord, _>(&series, series_uid)? {
                Some(existing) if existing.study_instance_uid != study_uid => {
                    return Err(IndexError::Conflict(format!(
                        "series {} belongs to study {}, not {}",
                        series_uid, existing.study_instance_uid, study_uid
                    )));
                }
                _ => {}
            }

            if patients.get(patient_id)?.is_none() {
                patients.insert(patient_id, serde_json::to_string(&entry.patient)?.as_str())?;
                tracing::debug!(patient_id, "created patient");
            }
            if studies.get(study_uid)?.is_none() {
                studies.insert(study_uid, serde_json::to_string(&entry.study)?.as_str())?;
                studies_by_patient.insert(link(patient_id, study_uid).as_str(), study_uid)?;
                tracing::debug!(study_uid, "created study");
            }
            if series.get(series_uid)?.is_none() {
                series.insert(series_uid, serde_json::to_string(&entry.series)?.as_str())?;
                series_by_study.insert(link(study_uid, series_uid).as_str(), series_uid)?;
                tracing::debug!(series_uid, "created series");
            }

            instances.insert(sop_uid, serde_json::to_string(&entry.instance)?.as_str())?;
            instances_by_series.insert(link(series_uid, sop_uid).as_str(), sop_uid)?;

            match previous {
                None => InsertOutcome::Created,
                Some(previous) => {
                    // An overwrite may move the instance; drop parents left empty
                    if previous.series_instance_uid != series_uid {
                        let old_series = previous.series_instance_uid.as_str();
                        instances_by_series.remove(link(old_series, sop_uid).as_str())?;
                        if children(&instances_by_series, old_series)?.is_empty() {
                            if let Some(record) = get_json::<SeriesRecord, _>(&series, old_series)? {
                                let old_study = record.study_instance_uid;
                                series.remove(old_series)?;
                                series_by_study.remove(link(&old_study, old_series).as_str())?;
                                if children(&series_by_study, &old_study)?.is_empty() {
                                    if let Some(study) = get_json::<StudyRecord, _>(&studies, &old_study)? {
                                        studies.remove(old_study.as_str())?;
                                        studies_by_patient
                                            .remove(link(&study.patient_id, &old_study).as_str())?;
                                        if children(&studies_by_patient, &study.patient_id)?.is_empty() {
                                            patients.remove(study.patient_id.as_str())?;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    InsertOutcome::Replaced(previous)
                }
            }
        };
        write_txn.commit()?;

        tracing::debug!(sop_instance_uid = sop_uid, ?outcome, "indexed instance");
        Ok(outcome)
    }

    pub fn instance(&self, sop_instance_uid: &str) -> IndexResult<Option<InstanceRecord>> {
        let read_txn = self.db.begin_read()?;
        get_json(&read_txn.open_table(INSTANCES)?, sop_instance_uid)
    }

    pub fn patient(&self, patient_id: &str) -> IndexResult<Option<PatientRecord>> {
        let read_txn = self.db.begin_read()?;
        get_json(&read_txn.open_table(PATIENTS)?, patient_id)
    }

    pub fn study(&self, study_instance_uid: &str) -> IndexResult<Option<StudyRecord>> {
        let read_txn = self.db.begin_read()?;
        get_json(&read_txn.open_table(STUDIES)?, study_instance_uid)
    }

    pub fn series(&self, series_instance_uid: &str) -> IndexResult<Option<SeriesRecord>> {
        let read_txn = self.db.begin_read()?;
        get_json(&read_txn.open_table(SERIES)?, series_instance_uid)
    }

    pub fn list_patients(&self) -> IndexResult<Vec<PatientRecord>> {
        let read_txn = self.db.begin_read()?;
        all_json(&read_txn.open_table(PATIENTS)?)
    }

    pub fn studies_of_patient(&self, patient_id: &str) -> IndexResult<Vec<StudyRecord>> {
        let read_txn = self.db.begin_read()?;
        Snapshot::new(&read_txn)?.children_of(Level::Patient, patient_id)
    }

    pub fn series_of_study(&self, study_instance_uid: &str) -> IndexResult<Vec<SeriesRecord>> {
        let read_txn = self.db.begin_read()?;
        Snapshot::new(&read_txn)?.children_of(Level::Study, study_instance_uid)
    }

    pub fn instances_of_series(&self, series_instance_uid: &str) -> IndexResult<Vec<InstanceRecord>> {
        let read_txn = self.db.begin_read()?;
        Snapshot::new(&read_txn)?.children_of(Level::Series, series_instance_uid)
    }

    pub fn statistics(&self) -> IndexResult<IndexStatistics> {
        let read_txn = self.db.begin_read()?;
        Ok(IndexStatistics {
            patients: read_txn.open_table(PATIENTS)?.len()?,
            studies: read_txn.open_table(STUDIES)?.len()?,
            series: read_txn.open_table(SERIES)?.len()?,
            instances: read_txn.open_table(INSTANCES)?.len()?,
            application_entities: read_txn.open_table(AE_TITLES)?.len()?,
        })
    }

    /// Entities at the query level that match, in key order, from one snapshot
    pub fn find(&self, query: &IndexQuery) -> IndexResult<Vec<MatchRow>> {
        let read_txn = self.db.begin_read()?;
        let snapshot = Snapshot::new(&read_txn)?;
        let mut rows = Vec::new();
        for row in snapshot.candidates(query)? {
            if query.matches(&row) {
                rows.push(row);
            }
        }
        tracing::debug!(level = %query.level(), matches = rows.len(), "index query");
        Ok(rows)
    }

    /// Every instance below the entities matching `query`, in stable order
    pub fn instances_matching(&self, query: &IndexQuery) -> IndexResult<Vec<InstanceRecord>> {
        let read_txn = self.db.begin_read()?;
        let snapshot = Snapshot::new(&read_txn)?;
        let mut instances = Vec::new();
        for row in snapshot.candidates(query)? {
            if !query.matches(&row) {
                continue;
            }
            match row.level {
                QueryLevel::Image => instances.extend(row.instance),
                QueryLevel::Series => {
                    if let Some(series) = &row.series {
                        instances.extend(
                            snapshot.children_of::<InstanceRecord>(Level::Series, &series.series_instance_uid)?,
                        );
                    }
                }
                QueryLevel::Study => {
                    if let Some(study) = &row.study {
                        instances.extend(snapshot.instances_of_study(&study.study_instance_uid)?);
                    }
                }
                QueryLevel::Patient => {
                    let studies: Vec<StudyRecord> =
                        snapshot.children_of(Level::Patient, &row.patient.patient_id)?;
                    for study in studies {
                        instances.extend(snapshot.instances_of_study(&study.study_instance_uid)?);
                    }
                }
            }
        }
        Ok(instances)
    }

    /// Adds an AE title; returns false when it is already registered
    pub fn register_ae(&self, record: &AeRecord) -> IndexResult<bool> {
        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(AE_TITLES)?;
            if table.get(record.ae_title.as_str())?.is_some() {
                false
            } else {
                table.insert(record.ae_title.as_str(), serde_json::to_string(record)?.as_str())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(created)
    }

    pub fn ae(&self, ae_title: &str) -> IndexResult<Option<AeRecord>> {
        let read_txn = self.db.begin_read()?;
        get_json(&read_txn.open_table(AE_TITLES)?, ae_title)
    }

    pub fn list_aes(&self) -> IndexResult<Vec<AeRecord>> {
        let read_txn = self.db.begin_read()?;
        all_json(&read_txn.open_table(AE_TITLES)?)
    }

    /// Registers configured peers, keeping entries that already exist
    ///
    /// Returns `(created, skipped)`.
    pub fn seed_aes(&self, nodes: &[RemoteNode]) -> IndexResult<(usize, usize)> {
        let mut created = 0;
        for node in nodes {
            if self.register_ae(&AeRecord::from(node))? {
                tracing::info!(ae_title = %node.ae_title, "registered AE {}", node);
                created += 1;
            }
        }
        Ok((created, nodes.len() - created))
    }
}

impl PeerRegistry for ArchiveIndex {
    fn lookup(&self, ae_title: &str) -> Option<RemoteNode> {
        match self.ae(ae_title.trim()) {
            Ok(record) => record.map(RemoteNode::from),
            Err(e) => {
                tracing::error!("AE registry lookup for '{}' failed: {}", ae_title, e);
                None
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Level {
    Patient,
    Study,
    Series,
}

type ReadTable = redb::ReadOnlyTable<&'static str, &'static str>;

/// Read-only view over one transaction
struct Snapshot {
    patients: ReadTable,
    studies: ReadTable,
    series: ReadTable,
    instances: ReadTable,
    studies_by_patient: ReadTable,
    series_by_study: ReadTable,
    instances_by_series: ReadTable,
}

impl Snapshot {
    fn new(txn: &ReadTransaction) -> IndexResult<Self> {
        Ok(Self {
            patients: txn.open_table(PATIENTS)?,
            studies: txn.open_table(STUDIES)?,
            series: txn.open_table(SERIES)?,
            instances: txn.open_table(INSTANCES)?,
            studies_by_patient: txn.open_table(STUDIES_BY_PATIENT)?,
            series_by_study: txn.open_table(SERIES_BY_STUDY)?,
            instances_by_series: txn.open_table(INSTANCES_BY_SERIES)?,
        })
    }

    fn links(&self, level: Level) -> (&ReadTable, &ReadTable) {
        match level {
            Level::Patient => (&self.studies_by_patient, &self.studies),
            Level::Study => (&self.series_by_study, &self.series),
            Level::Series => (&self.instances_by_series, &self.instances),
        }
    }

    fn child_keys(&self, level: Level, parent: &str) -> IndexResult<Vec<String>> {
        children(self.links(level).0, parent)
    }

    fn children_of<T: DeserializeOwned>(&self, level: Level, parent: &str) -> IndexResult<Vec<T>> {
        let (links, records) = self.links(level);
        let mut out = Vec::new();
        for key in children(links, parent)? {
            if let Some(record) = get_json(records, &key)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn instances_of_study(&self, study_uid: &str) -> IndexResult<Vec<InstanceRecord>> {
        let mut out = Vec::new();
        for series_uid in self.child_keys(Level::Study, study_uid)? {
            out.extend(self.children_of::<InstanceRecord>(Level::Series, &series_uid)?);
        }
        Ok(out)
    }

    /// Keys at `level` to consider, narrowed by exact unique or parent keys
    fn candidate_keys(&self, query: &IndexQuery) -> IndexResult<Vec<String>> {
        use dicom_dictionary_std::tags;

        let exact = |tag| query.matcher(tag).and_then(|m| m.exact_values());
        let single = |tag| query.matcher(tag).and_then(|m| m.single_value());
        let all_keys = |table: &ReadTable| -> IndexResult<Vec<String>> {
            let mut keys = Vec::new();
            for entry in table.iter()? {
                keys.push(entry?.0.value().to_string());
            }
            Ok(keys)
        };
        let owned = |values: Vec<&str>| values.into_iter().map(str::to_string).collect::<Vec<_>>();

        let mut keys = match query.level() {
            QueryLevel::Patient => match exact(tags::PATIENT_ID) {
                Some(ids) => owned(ids),
                None => all_keys(&self.patients)?,
            },
            QueryLevel::Study => match (exact(tags::STUDY_INSTANCE_UID), single(tags::PATIENT_ID)) {
                (Some(uids), _) => owned(uids),
                (None, Some(patient_id)) => self.child_keys(Level::Patient, patient_id)?,
                (None, None) => all_keys(&self.studies)?,
            },
            QueryLevel::Series => match (exact(tags::SERIES_INSTANCE_UID), single(tags::STUDY_INSTANCE_UID)) {
                (Some(uids), _) => owned(uids),
                (None, Some(study_uid)) => self.child_keys(Level::Study, study_uid)?,
                (None, None) => all_keys(&self.series)?,
            },
            QueryLevel::Image => match (exact(tags::SOP_INSTANCE_UID), single(tags::SERIES_INSTANCE_UID)) {
                (Some(uids), _) => owned(uids),
                (None, Some(series_uid)) => self.child_keys(Level::Series, series_uid)?,
                (None, None) => all_keys(&self.instances)?,
            },
        };
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Rows for every candidate key with ancestors and requested derived values
    fn candidates(&self, query: &IndexQuery) -> IndexResult<Vec<MatchRow>> {
        let mut patients: HashMap<String, Option<PatientRecord>> = HashMap::new();
        let mut studies: HashMap<String, Option<StudyRecord>> = HashMap::new();
        let mut series_cache: HashMap<String, Option<SeriesRecord>> = HashMap::new();

        let mut rows = Vec::new();
        for key in self.candidate_keys(query)? {
            let mut instance = None;
            let mut series = None;
            let mut study = None;

            let patient_id = match query.level() {
                QueryLevel::Patient => key.clone(),
                level => {
                    let mut series_uid = key.clone();
                    if level == QueryLevel::Image {
                        let Some(record) = get_json::<InstanceRecord, _>(&self.instances, &key)? else {
                            continue;
                        };
                        series_uid = record.series_instance_uid.clone();
                        instance = Some(record);
                    }
                    let mut study_uid = key.clone();
                    if matches!(level, QueryLevel::Series | QueryLevel::Image) {
                        if !series_cache.contains_key(&series_uid) {
                            series_cache.insert(series_uid.clone(), get_json(&self.series, &series_uid)?);
                        }
                        let Some(record) = series_cache.get(&series_uid).cloned().flatten() else {
                            continue;
                        };
                        study_uid = record.study_instance_uid.clone();
                        series = Some(record);
                    }
                    if !studies.contains_key(&study_uid) {
                        studies.insert(study_uid.clone(), get_json(&self.studies, &study_uid)?);
                    }
                    let Some(record) = studies.get(&study_uid).cloned().flatten() else {
                        continue;
                    };
                    let patient_id = record.patient_id.clone();
                    study = Some(record);
                    patient_id
                }
            };

            if !patients.contains_key(&patient_id) {
                patients.insert(patient_id.clone(), get_json(&self.patients, &patient_id)?);
            }
            let Some(patient) = patients.get(&patient_id).cloned().flatten() else {
                continue;
            };

            let mut row = MatchRow {
                level: query.level(),
                patient,
                study,
                series,
                instance,
                derived: Derived::default(),
            };
            self.derive(query, &mut row)?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn derive(&self, query: &IndexQuery, row: &mut MatchRow) -> IndexResult<()> {
        use dicom_dictionary_std::tags;

        if query.requests(tags::NUMBER_OF_PATIENT_RELATED_STUDIES) {
            row.derived.patient_related_studies =
                Some(self.child_keys(Level::Patient, &row.patient.patient_id)?.len());
        }
        let Some(study_uid) = row.study.as_ref().map(|s| s.study_instance_uid.clone()) else {
            return Ok(());
        };
        let wants_modalities = query.requests(tags::MODALITIES_IN_STUDY);
        let wants_series = query.requests(tags::NUMBER_OF_STUDY_RELATED_SERIES);
        let wants_instances = query.requests(tags::NUMBER_OF_STUDY_RELATED_INSTANCES);
        if wants_modalities || wants_series || wants_instances {
            let series_uids = self.child_keys(Level::Study, &study_uid)?;
            if wants_modalities {
                let mut modalities = BTreeSet::new();
                for uid in &series_uids {
                    if let Some(series) = get_json::<SeriesRecord, _>(&self.series, uid)? {
                        if !series.modality.is_empty() {
                            modalities.insert(series.modality);
                        }
                    }
                }
                row.derived.modalities_in_study =
                    Some(modalities.into_iter().collect::<Vec<_>>().join("\\"));
            }
            if wants_series {
                row.derived.study_related_series = Some(series_uids.len());
            }
            if wants_instances {
                let mut total = 0;
                for uid in &series_uids {
                    total += self.child_keys(Level::Series, uid)?.len();
                }
                row.derived.study_related_instances = Some(total);
            }
        }
        if query.requests(tags::NUMBER_OF_SERIES_RELATED_INSTANCES) {
            if let Some(series) = &row.series {
                row.derived.series_related_instances =
                    Some(self.child_keys(Level::Series, &series.series_instance_uid)?.len());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
