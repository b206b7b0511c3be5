//! Service Class Provider (SCP) implementation for inbound DIMSE operations

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::association::{
    self, AcceptorOptions, AssociationInfo, AssociationReader, AssociationWriter, Inbound,
};
use crate::config::{DimseConfig, PeerRegistry};
use crate::message::DimseMessage;
use crate::pdu::{provider_abort, AbortRQServiceProviderReason};
use crate::router::ServiceRegistry;
use crate::types::CommandField;
use crate::{DimseError, Result};

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: DimseConfig,
    services: Arc<ServiceRegistry>,
    peers: Arc<dyn PeerRegistry>,
    active_associations: Arc<Semaphore>,
}

impl DimseScp {
    /// Create a new SCP serving the registered services
    pub fn new(
        config: DimseConfig,
        services: ServiceRegistry,
        peers: Arc<dyn PeerRegistry>,
    ) -> Self {
        let active_associations = Arc::new(Semaphore::new(config.max_associations as usize));
        Self {
            config,
            services: Arc::new(services),
            peers,
            active_associations,
        }
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept associations on an already bound listener
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting DIMSE SCP on {} (AET: {})",
            listener.local_addr()?,
            self.config.local_aet
        );

        let options = Arc::new(AcceptorOptions {
            ae_title: self.config.local_aet.clone(),
            max_pdu: self.config.max_pdu,
            supported: self.services.supported_contexts(),
            accept_unknown_calling_aets: self.config.accept_unknown_calling_aets,
            peers: Arc::clone(&self.peers),
            artim_timeout: self.config.artim_timeout(),
        });
        let scp = Arc::new(self);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let scp = Arc::clone(&scp);
                    let options = Arc::clone(&options);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = scp
                            .handle_association(stream, peer_addr, &options, shutdown)
                            .await
                        {
                            match e {
                                DimseError::AssociationRejected(_) | DimseError::ConnectionClosed => {
                                    debug!("Association from {} ended: {}", peer_addr, e)
                                }
                                _ => error!("Error handling association from {}: {}", peer_addr, e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    /// Handle a single association from negotiation to release or abort
    async fn handle_association(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        options: &AcceptorOptions,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let permit = Arc::clone(&self.active_associations).try_acquire_owned().ok();
        if permit.is_none() {
            warn!(
                "Maximum associations reached, rejecting association from {}",
                peer_addr
            );
        }

        let association = association::accept(stream, options, permit.is_none()).await?;
        let (reader, writer, info) = association.into_parts();

        let span = info_span!(
            "association",
            id = %Uuid::new_v4(),
            peer = %peer_addr,
            calling_ae = %info.calling_ae_title,
        );
        async move {
            info!("Association established");
            let result = AssociationWorker {
                services: Arc::clone(&self.services),
                info,
                writer,
                idle_timeout: self.config.association_timeout(),
            }
            .run(reader, shutdown)
            .await;
            drop(permit);
            info!("Association finished");
            result
        }
        .instrument(span)
        .await
    }
}

/// What the reading task hands to the worker
enum Event {
    Request(DimseMessage, CancellationToken),
    Release,
    PeerAborted,
    Closed,
    IdleTimeout,
    Failed(DimseError),
}

/// Tokens of running C-FIND/C-MOVE operations keyed by message ID
#[derive(Clone, Default)]
struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<u16, CancellationToken>>>,
}

impl CancelRegistry {
    fn register(&self, message_id: u16) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id, token.clone());
        token
    }

    fn cancel(&self, message_id: u16) -> bool {
        match self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn finish(&self, message_id: u16) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message_id);
    }

    fn cancel_all(&self) {
        for token in self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            token.cancel();
        }
    }
}

/// Processes the DIMSE traffic of one established association
///
/// A reading task keeps consuming PDUs so that C-CANCEL, release and abort
/// are observed while an operation runs; requests are queued and handled one
/// at a time in arrival order.
struct AssociationWorker {
    services: Arc<ServiceRegistry>,
    info: Arc<AssociationInfo>,
    writer: AssociationWriter,
    idle_timeout: Duration,
}

impl AssociationWorker {
    async fn run(mut self, reader: AssociationReader, shutdown: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(32);
        let cancels = CancelRegistry::default();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let reading = tokio::spawn(
            read_loop(
                reader,
                tx,
                cancels.clone(),
                Arc::clone(&outstanding),
                self.idle_timeout,
            )
            .in_current_span(),
        );

        let result = loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    cancels.cancel_all();
                    let _ = self.writer.abort(provider_abort(AbortRQServiceProviderReason::ReasonNotSpecified)).await;
                    break Ok(());
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break Ok(());
            };
            match event {
                Event::Request(message, token) => {
                    let message_id = message.command.message_id();
                    let outcome = self
                        .services
                        .dispatch(&self.info, message, &mut self.writer, token)
                        .await;
                    if let Some(id) = message_id {
                        cancels.finish(id);
                    }
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = outcome {
                        warn!("Aborting association: {}", e);
                        let _ = self
                            .writer
                            .abort(provider_abort(e.abort_reason()))
                            .await;
                        break Err(e);
                    }
                }
                Event::Release => {
                    debug!("A-RELEASE-RQ received");
                    break self.writer.send_release_reply().await;
                }
                Event::PeerAborted => break Ok(()),
                Event::Closed => {
                    debug!("Peer closed the connection");
                    break Ok(());
                }
                Event::IdleTimeout => {
                    warn!("Association idle for {:?}, aborting", self.idle_timeout);
                    let _ = self
                        .writer
                        .abort(provider_abort(AbortRQServiceProviderReason::ReasonNotSpecified))
                        .await;
                    break Err(DimseError::Timeout("association idle".to_string()));
                }
                Event::Failed(e) => {
                    warn!("Protocol error, aborting association: {}", e);
                    let _ = self
                        .writer
                        .abort(provider_abort(e.abort_reason()))
                        .await;
                    break Err(e);
                }
            }
        };

        cancels.cancel_all();
        reading.abort();
        result
    }
}

async fn read_loop(
    mut reader: AssociationReader,
    tx: mpsc::Sender<Event>,
    cancels: CancelRegistry,
    outstanding: Arc<AtomicUsize>,
    idle_timeout: Duration,
) {
    loop {
        let inbound = match timeout(idle_timeout, reader.recv()).await {
            Ok(inbound) => inbound,
            Err(_) if outstanding.load(Ordering::SeqCst) > 0 => continue,
            Err(_) => {
                let _ = tx.send(Event::IdleTimeout).await;
                return;
            }
        };

        let event = match inbound {
            Ok(Inbound::Message(message)) => {
                match message.command.command_field() {
                    Ok(CommandField::CCancelRq) => {
                        if let Some(id) = message.command.message_id_being_responded_to() {
                            let found = cancels.cancel(id);
                            debug!(message_id = id, found, "C-CANCEL-RQ");
                        }
                        continue;
                    }
                    Ok(CommandField::CFindRq | CommandField::CMoveRq) => {
                        let token = match message.command.message_id() {
                            Some(id) => cancels.register(id),
                            None => CancellationToken::new(),
                        };
                        outstanding.fetch_add(1, Ordering::SeqCst);
                        Event::Request(message, token)
                    }
                    _ => {
                        outstanding.fetch_add(1, Ordering::SeqCst);
                        Event::Request(message, CancellationToken::new())
                    }
                }
            }
            Ok(Inbound::ReleaseRequested) => Event::Release,
            Ok(Inbound::Aborted(source)) => {
                info!(?source, "Association aborted by peer");
                cancels.cancel_all();
                Event::PeerAborted
            }
            Ok(Inbound::Closed) => {
                cancels.cancel_all();
                Event::Closed
            }
            Err(e) => {
                cancels.cancel_all();
                Event::Failed(e)
            }
        };

        let last = !matches!(event, Event::Request(..));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}
