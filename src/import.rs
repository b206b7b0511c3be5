//! Folder import: archives every Part-10 file below a directory through the
//! same store transaction as a network C-STORE

use std::path::{Path, PathBuf};

use dicom_object::open_file;
use dimse::message::write_data_set;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::services::store::{StorageService, StoreError, StoreInput};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("import task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    /// Files that are not DICOM Part-10 or are already archived
    pub skipped: usize,
    pub failed: usize,
}

enum Candidate {
    Dicom(StoreInput),
    NotDicom(String),
    Unencodable(String),
}

fn read_candidate(path: &Path) -> Candidate {
    let file = match open_file(path) {
        Ok(file) => file,
        Err(e) => return Candidate::NotDicom(e.to_string()),
    };
    let meta = file.meta();
    let transfer_syntax = meta.transfer_syntax().to_string();
    let sop_class_uid = meta.media_storage_sop_class_uid().to_string();
    let sop_instance_uid = meta.media_storage_sop_instance_uid().to_string();
    match write_data_set(&file, &transfer_syntax) {
        Ok(data) => Candidate::Dicom(StoreInput {
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax,
            data,
            calling_ae: None,
        }),
        Err(e) => Candidate::Unencodable(e.to_string()),
    }
}

/// Imports all files below `root`, continuing past individual failures
pub async fn import_directory(
    service: &StorageService,
    root: &Path,
) -> Result<ImportSummary, ImportError> {
    if !root.is_dir() {
        return Err(ImportError::NotADirectory(root.to_path_buf()));
    }

    let walk_root = root.to_path_buf();
    let (files, unreadable) = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let mut unreadable = 0;
        for entry in WalkDir::new(&walk_root).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => {
                    warn!("cannot read directory entry: {}", e);
                    unreadable += 1;
                }
            }
        }
        (files, unreadable)
    })
    .await
    .map_err(|e| ImportError::Task(e.to_string()))?;

    info!("Importing {} files from {}", files.len(), root.display());
    let mut summary = ImportSummary {
        failed: unreadable,
        ..ImportSummary::default()
    };
    for path in files {
        let read_path = path.clone();
        let candidate = tokio::task::spawn_blocking(move || read_candidate(&read_path))
            .await
            .map_err(|e| ImportError::Task(e.to_string()))?;

        let input = match candidate {
            Candidate::Dicom(input) => input,
            Candidate::NotDicom(reason) => {
                debug!(path = %path.display(), "skipping non-DICOM file: {}", reason);
                summary.skipped += 1;
                continue;
            }
            Candidate::Unencodable(reason) => {
                warn!(path = %path.display(), "cannot encode data set: {}", reason);
                summary.failed += 1;
                continue;
            }
        };

        match service.ingest(input).await {
            Ok(_) => summary.imported += 1,
            Err(StoreError::Duplicate(uid)) => {
                debug!(path = %path.display(), sop_instance_uid = %uid, "already archived");
                summary.skipped += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), "import failed: {}", e);
                summary.failed += 1;
            }
        }
    }

    info!(
        imported = summary.imported,
        skipped = summary.skipped,
        failed = summary.failed,
        "Import finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use crate::index::ArchiveIndex;
    use crate::storage::FilesystemStore;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, Tag, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use std::sync::Arc;
    use tempfile::TempDir;

    const CT: &str = "1.2.840.10008.5.1.4.1.1.2";

    fn put(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    fn write_part10(path: &Path, sop_uid: &str) {
        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, tags::SOP_CLASS_UID, VR::UI, CT);
        put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_uid);
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");
        put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.1");
        put(&mut obj, tags::PATIENT_ID, VR::LO, "PID1");
        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(CT)
                    .media_storage_sop_instance_uid(sop_uid)
                    .transfer_syntax("1.2.840.10008.1.2.1"),
            )
            .unwrap();
        file.write_to_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_import_directory_counts() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        write_part10(&source.join("a.dcm"), "1.2.3.1.1");
        write_part10(&source.join("nested").join("b.dcm"), "1.2.3.1.2");
        write_part10(&source.join("nested").join("copy.dcm"), "1.2.3.1.1");
        std::fs::write(source.join("README.txt"), b"not dicom").unwrap();

        let index = Arc::new(ArchiveIndex::open(&dir.path().join("index.redb")).unwrap());
        let store = Arc::new(FilesystemStore::new(dir.path().join("archive")).unwrap());
        let service = StorageService::new(
            Arc::clone(&index),
            store,
            DuplicatePolicy::Reject,
            dimse::sop_class::uncompressed_transfer_syntaxes(),
        );

        let summary = import_directory(&service, &source).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                imported: 2,
                skipped: 2,
                failed: 0,
            }
        );
        assert_eq!(index.statistics().unwrap().instances, 2);
    }

    #[tokio::test]
    async fn test_import_requires_directory() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(ArchiveIndex::open(&dir.path().join("index.redb")).unwrap());
        let store = Arc::new(FilesystemStore::new(dir.path().join("archive")).unwrap());
        let service = StorageService::new(index, store, DuplicatePolicy::Reject, Vec::new());

        let err = import_directory(&service, &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::NotADirectory(_)));
    }
}
