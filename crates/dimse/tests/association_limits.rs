use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dimse::pdu::{RejectCause, RejectResult};
use dimse::{
    sop_class, DimseConfig, DimseError, DimseResponse, DimseScp, DimseScu, DimseStatus,
    EchoHandler, RemoteNode, RequestContext, ServiceClass, ServiceRegistry,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Echo;

impl ServiceClass for Echo {
    fn sop_classes(&self) -> Vec<String> {
        vec![sop_class::VERIFICATION.to_string()]
    }
}

#[async_trait]
impl EchoHandler for Echo {
    async fn echo(&self, _ctx: &RequestContext) -> DimseResponse {
        DimseResponse::success()
    }
}

async fn start(config: DimseConfig) -> (u16, CancellationToken, JoinHandle<dimse::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut registry = ServiceRegistry::new();
    registry.register_echo(Arc::new(Echo));
    let scp = DimseScp::new(config, registry, Arc::new(Vec::<RemoteNode>::new()));
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(scp.serve(listener, shutdown.clone()));
    (port, shutdown, server)
}

fn verification() -> Vec<(String, Vec<String>)> {
    vec![(
        sop_class::VERIFICATION.to_string(),
        sop_class::uncompressed_transfer_syntaxes(),
    )]
}

#[tokio::test]
async fn silent_peer_is_dropped_after_artim() {
    let (port, shutdown, server) = start(DimseConfig {
        local_aet: "ARTIM".to_string(),
        artim_timeout_ms: 300,
        ..DimseConfig::default()
    })
    .await;

    let started = Instant::now();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection still open long after ARTIM expiry");

    // closed without any PDU
    assert_eq!(read.unwrap_or(0), 0);
    assert!(started.elapsed() >= Duration::from_millis(250));

    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_pdu_type_is_answered_with_provider_abort() {
    let (port, shutdown, server) = start(DimseConfig {
        local_aet: "GARBAGE".to_string(),
        ..DimseConfig::default()
    })
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&[0x09, 0, 0, 0, 0, 0]).await.unwrap();

    let mut abort = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut abort))
        .await
        .expect("no reply to unknown PDU type")
        .unwrap();
    // A-ABORT, service provider, unrecognized PDU
    assert_eq!(abort, [0x07, 0, 0, 0, 0, 4, 0, 0, 2, 1]);

    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(rest.is_empty());

    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn association_over_limit_is_rejected_transiently() {
    let (port, shutdown, server) = start(DimseConfig {
        local_aet: "BUSY".to_string(),
        max_associations: 1,
        ..DimseConfig::default()
    })
    .await;

    let scu = DimseScu::new(DimseConfig {
        local_aet: "ECHOSCU".to_string(),
        ..DimseConfig::default()
    });
    let node = RemoteNode::new("BUSY", "127.0.0.1", port);

    let mut held = scu.connect(&node, &verification()).await.unwrap();
    assert_eq!(held.echo().await.unwrap(), DimseStatus::Success);

    match scu.connect(&node, &verification()).await {
        Err(DimseError::AssociationRejected(reason)) => {
            assert_eq!(reason.result, RejectResult::Transient);
            assert_eq!(reason.cause, RejectCause::LocalLimitExceeded);
        }
        Err(other) => panic!("expected a transient rejection, got {}", other),
        Ok(_) => panic!("second association accepted beyond the limit"),
    }

    held.release().await.unwrap();
    shutdown.cancel();
    server.await.unwrap().unwrap();
}
