//! DIMSE services of the archive
//!
//! Each service implements one or more of the dimse capability traits and
//! is registered with a [`dimse::ServiceRegistry`] for its SOP classes.

pub mod echo;
pub mod find;
pub mod retrieve;
pub mod store;

use std::sync::Arc;

use crate::index::{ArchiveIndex, IndexError, IndexResult};

pub use echo::VerificationService;
pub use find::QueryService;
pub use retrieve::RetrieveService;
pub use store::{StorageService, StoreError, StoreInput, StoreReport};

/// Runs an index operation on the blocking pool
pub(crate) async fn with_index<T, F>(index: &Arc<ArchiveIndex>, op: F) -> IndexResult<T>
where
    F: FnOnce(&ArchiveIndex) -> IndexResult<T> + Send + 'static,
    T: Send + 'static,
{
    let index = Arc::clone(index);
    tokio::task::spawn_blocking(move || op(&index))
        .await
        .map_err(|e| IndexError::Task(e.to_string()))?
}
