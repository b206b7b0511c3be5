//! mupacs: a minimal PACS node
//!
//! Receives instances over DICOM C-STORE, archives them in a filesystem
//! object store indexed by a redb hierarchy, and answers C-FIND and C-MOVE
//! requests from that index. The network protocol lives in the `dimse`
//! workspace crate; this crate wires the archive and services onto it.

pub mod config;
pub mod import;
pub mod index;
pub mod logging;
pub mod services;
pub mod storage;

use std::sync::Arc;

use dimse::{DimseError, DimseScp, DimseScu, ServiceRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::index::{ArchiveIndex, IndexError};
use crate::services::{QueryService, RetrieveService, StorageService, VerificationService};
use crate::storage::{FilesystemStore, ObjectStore, StorageError};

pub use crate::logging::init_logging;

#[derive(Debug, Error)]
pub enum PacsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dimse(#[from] DimseError),
}

/// An opened archive and the services built on it
pub struct Pacs {
    config: Config,
    index: Arc<ArchiveIndex>,
    store: Arc<FilesystemStore>,
    storage: Arc<StorageService>,
}

impl Pacs {
    /// Opens the object store and index and seeds the AE registry from config
    pub fn open(config: Config) -> Result<Self, PacsError> {
        let store = Arc::new(FilesystemStore::new(&config.archive.storage_dir)?);
        let index = Arc::new(ArchiveIndex::open(&config.archive.index_path())?);

        let peers = config.peers()?;
        let (created, skipped) = index.seed_aes(&peers)?;
        tracing::info!(created, skipped, "AE registry seeded");

        let storage = Arc::new(StorageService::new(
            Arc::clone(&index),
            store.clone(),
            config.archive.duplicate_policy,
            config.dimse.storage_transfer_syntaxes.clone(),
        ));

        Ok(Self {
            config,
            index,
            store,
            storage,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<ArchiveIndex> {
        &self.index
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn storage_service(&self) -> &Arc<StorageService> {
        &self.storage
    }

    /// Handlers for every enabled service
    pub fn services(&self) -> ServiceRegistry {
        let dimse = &self.config.dimse;
        let match_absent = self.config.archive.match_absent_attributes;
        let mut registry = ServiceRegistry::new();

        if dimse.enable_echo {
            registry.register_echo(Arc::new(VerificationService::new(
                dimse.preferred_transfer_syntaxes.clone(),
            )));
        }
        if dimse.enable_store {
            registry.register_store(self.storage.clone());
        }
        if dimse.enable_find {
            registry.register_find(Arc::new(QueryService::new(
                Arc::clone(&self.index),
                match_absent,
                dimse.preferred_transfer_syntaxes.clone(),
            )));
        }
        if dimse.enable_move {
            registry.register_move(Arc::new(RetrieveService::new(
                Arc::clone(&self.index),
                self.object_store(),
                DimseScu::new(dimse.clone()),
                match_absent,
                dimse.preferred_transfer_syntaxes.clone(),
                dimse.max_concurrent_moves as usize,
            )));
        }
        registry
    }

    pub fn scp(&self) -> DimseScp {
        DimseScp::new(
            self.config.dimse.clone(),
            self.services(),
            self.index.clone(),
        )
    }

    /// Serves on the configured address until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PacsError> {
        self.scp().run(shutdown).await?;
        Ok(())
    }

    /// Serves on an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), PacsError> {
        self.scp().serve(listener, shutdown).await?;
        Ok(())
    }
}

/// Runs the archive until Ctrl-C
pub async fn run(config: Config) -> Result<(), PacsError> {
    let pacs = Pacs::open(config)?;
    let stats = pacs.index().statistics()?;
    tracing::info!(
        patients = stats.patients,
        studies = stats.studies,
        instances = stats.instances,
        "Starting mupacs '{}'",
        pacs.config().dimse.local_aet
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        signal.cancel();
    });

    pacs.run(shutdown).await
}
