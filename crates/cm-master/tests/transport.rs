//! Shared-listener transport integration tests

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use cm_core::config::{AgentResourceConfig, MasterConfig, TlsConfig};
use cm_core::{ClusterStore, SnapshotStore};
use cm_master::error::{ListenerError, MasterError, TransportError};
use cm_master::transport::{
    acceptor_from_config, resolve_listener, Activation, Demux, MuxStream, Routes, SecureListener,
    SubListener,
};
use cm_master::Master;
use cm_wire::{FrameHeader, FrameKind, EMPTY_SETTINGS, FLAG_ACK, HTTP2_PREFACE};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

const HTTP1_REQUEST: &[u8] = b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n";

async fn plaintext_demux() -> (u16, Routes) {
    let base = resolve_listener(&Activation::none(), 0).await.unwrap();
    let port = base.port();
    let (demux, routes) = Demux::new(SecureListener::new(base, None), Duration::from_secs(5));
    tokio::spawn(demux.serve());
    (port, routes)
}

async fn accept_within(listener: &SubListener, wait: Duration) -> Option<MuxStream> {
    tokio::time::timeout(wait, listener.accept())
        .await
        .ok()
        .map(|conn| conn.unwrap())
}

/// HTTP/2 preface followed by one HEADERS frame carrying `content_type`
fn h2_request(content_type: &str) -> Vec<u8> {
    let mut encoder = hpack::Encoder::new();
    let block = encoder.encode(vec![
        (&b":method"[..], &b"POST"[..]),
        (&b":scheme"[..], &b"http"[..]),
        (&b":path"[..], &b"/grpc.health.v1.Health/Check"[..]),
        (&b":authority"[..], &b"localhost"[..]),
        (&b"content-type"[..], content_type.as_bytes()),
    ]);

    let mut buf = BytesMut::new();
    buf.extend_from_slice(HTTP2_PREFACE);
    FrameHeader::new(FrameKind::Settings, 0, 0, 0).encode(&mut buf);
    FrameHeader::new(FrameKind::Headers, 0x4, 1, block.len() as u32).encode(&mut buf);
    buf.extend_from_slice(&block);
    buf.to_vec()
}

async fn read_exactly(conn: &mut MuxStream, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

#[tokio::test]
async fn test_http1_goes_to_http_only() {
    let (port, routes) = plaintext_demux().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(HTTP1_REQUEST).await.unwrap();

    let mut conn = accept_within(&routes.http, Duration::from_secs(5))
        .await
        .expect("HTTP/1 connection should reach the HTTP listener");
    assert_eq!(read_exactly(&mut conn, HTTP1_REQUEST.len()).await, HTTP1_REQUEST);
    assert!(accept_within(&routes.rpc, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_grpc_goes_to_rpc_only() {
    let (port, routes) = plaintext_demux().await;
    let request = h2_request("application/grpc+proto");

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&request).await.unwrap();

    let mut conn = accept_within(&routes.rpc, Duration::from_secs(5))
        .await
        .expect("gRPC connection should reach the RPC listener");
    assert_eq!(read_exactly(&mut conn, request.len()).await, request);
    assert!(accept_within(&routes.http, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_plain_h2_goes_to_http() {
    let (port, routes) = plaintext_demux().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&h2_request("application/json")).await.unwrap();

    assert!(accept_within(&routes.http, Duration::from_secs(5)).await.is_some());
    assert!(accept_within(&routes.rpc, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_client_waiting_for_server_settings_is_served() {
    let (port, routes) = plaintext_demux().await;
    let request = h2_request("application/grpc");
    let (opening, headers) = request.split_at(HTTP2_PREFACE.len() + 9);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(opening).await.unwrap();

    let mut settings = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut settings))
        .await
        .expect("server SETTINGS should arrive before any request is sent")
        .unwrap();
    assert_eq!(settings, EMPTY_SETTINGS);

    let mut rest = BytesMut::new();
    FrameHeader::new(FrameKind::Settings, FLAG_ACK, 0, 0).encode(&mut rest);
    rest.extend_from_slice(headers);
    client.write_all(&rest).await.unwrap();

    let mut conn = accept_within(&routes.rpc, Duration::from_secs(5))
        .await
        .expect("gRPC connection should reach the RPC listener");
    // the ACK answered our SETTINGS and is not replayed
    assert_eq!(read_exactly(&mut conn, request.len()).await, request);
}

#[tokio::test]
async fn test_closing_rpc_leaves_http_serving() {
    let (port, routes) = plaintext_demux().await;
    routes.rpc.close();

    let mut grpc = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    grpc.write_all(&h2_request("application/grpc")).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(HTTP1_REQUEST).await.unwrap();
    assert!(accept_within(&routes.http, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn test_too_many_inherited_listeners() {
    let result = resolve_listener(&Activation::from_fds(vec![3, 4]), 0).await;
    assert!(matches!(result, Err(ListenerError::TooManyInherited(2))));
}

fn write_certificate(dir: &Path) -> (TlsConfig, rcgen::CertifiedKey) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.join("master.crt");
    let key = dir.join("master.key");
    std::fs::write(&cert, generated.cert.pem()).unwrap();
    std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
    (
        TlsConfig {
            cert: Some(cert),
            key: Some(key),
        },
        generated,
    )
}

async fn tls_demux(tls: &TlsConfig) -> (u16, Routes) {
    tls_demux_with(tls, &AgentResourceConfig::default()).await
}

async fn tls_demux_with(tls: &TlsConfig, agents: &AgentResourceConfig) -> (u16, Routes) {
    let acceptor = acceptor_from_config(tls, agents)
        .unwrap()
        .expect("certificate configured");
    let base = resolve_listener(&Activation::none(), 0).await.unwrap();
    let port = base.port();
    let (demux, routes) =
        Demux::new(SecureListener::new(base, Some(acceptor)), Duration::from_secs(2));
    tokio::spawn(demux.serve());
    (port, routes)
}

#[tokio::test]
async fn test_tls12_client_is_served() {
    let dir = tempfile::tempdir().unwrap();
    let (tls, generated) = write_certificate(dir.path());
    let (port, routes) = tls_demux(&tls).await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(generated.cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS12])
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut client = connector.connect(server_name, tcp).await.unwrap();
    client.write_all(HTTP1_REQUEST).await.unwrap();
    client.flush().await.unwrap();

    let mut conn = accept_within(&routes.http, Duration::from_secs(5))
        .await
        .expect("TLS connection should reach the HTTP listener");
    assert_eq!(read_exactly(&mut conn, HTTP1_REQUEST.len()).await, HTTP1_REQUEST);
}

#[tokio::test]
async fn test_plaintext_client_is_rejected_by_tls_listener() {
    let dir = tempfile::tempdir().unwrap();
    let (tls, _generated) = write_certificate(dir.path());
    let (port, routes) = tls_demux(&tls).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(HTTP1_REQUEST).await.unwrap();

    assert!(accept_within(&routes.http, Duration::from_millis(500)).await.is_none());
    assert!(accept_within(&routes.rpc, Duration::from_millis(100)).await.is_none());

    // the server answers garbage with an alert or a close, never with HTTP
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response)).await;
    assert!(!response.starts_with(b"HTTP/"));
}

/// Certificate authority that issues agent client certificates
struct AgentCa {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

impl AgentCa {
    fn new(name: &str) -> Self {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, name);
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    fn issue(&self, agent: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![agent.to_string()]).unwrap();
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (
            vec![cert.der().clone()],
            PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
    }
}

/// Connect over TLS, optionally presenting a client certificate, and send
/// one HTTP/1 request
async fn tls_request(
    port: u16,
    server_cert: &rcgen::CertifiedKey,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(server_cert.cert.der().clone()).unwrap();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots);
    let client_config = match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain, key).unwrap(),
        None => builder.with_no_client_auth(),
    };
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    // with TLS 1.3 a rejected client certificate surfaces after the handshake
    if let Ok(mut client) = connector.connect(server_name, tcp).await {
        let _ = client.write_all(HTTP1_REQUEST).await;
        let _ = client.flush().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_client_certificates_are_verified_if_presented() {
    let dir = tempfile::tempdir().unwrap();
    let (tls, generated) = write_certificate(dir.path());
    let ca = AgentCa::new("agent CA");
    let ca_path = dir.path().join("agent-ca.pem");
    std::fs::write(&ca_path, ca.cert.pem()).unwrap();
    let agents = AgentResourceConfig {
        require_authentication: true,
        client_ca: Some(ca_path),
    };
    let (port, routes) = tls_demux_with(&tls, &agents).await;

    // no certificate: still served
    tls_request(port, &generated, None).await;
    assert!(accept_within(&routes.http, Duration::from_secs(5)).await.is_some());

    // certificate issued by the configured CA: served
    tls_request(port, &generated, Some(ca.issue("agent-1"))).await;
    assert!(accept_within(&routes.http, Duration::from_secs(5)).await.is_some());

    // certificate from an unknown CA: rejected
    let stranger = AgentCa::new("unknown CA");
    tls_request(port, &generated, Some(stranger.issue("agent-2"))).await;
    assert!(accept_within(&routes.http, Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn test_authentication_without_client_ca_serves_anonymous_clients() {
    let dir = tempfile::tempdir().unwrap();
    let (tls, generated) = write_certificate(dir.path());
    let agents = AgentResourceConfig {
        require_authentication: true,
        client_ca: None,
    };
    let (port, routes) = tls_demux_with(&tls, &agents).await;

    tls_request(port, &generated, None).await;
    assert!(accept_within(&routes.http, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn test_master_serves_http_and_grpc_on_one_port() {
    let mut config = MasterConfig::default();
    config.port = 0;
    let store: Arc<dyn ClusterStore> = Arc::new(SnapshotStore::in_memory());

    let bound = Master::new(config, store).bind().await.unwrap();
    let port = bound.port();
    assert_ne!(port, 0);

    let cancel = CancellationToken::new();
    let master = tokio::spawn(bound.run(cancel.clone()));

    let client = reqwest::Client::new();
    let health_url = format!("http://127.0.0.1:{}/health", port);
    let mut ready = false;
    for _ in 0..100 {
        if let Ok(response) = client.get(&health_url).send().await {
            if response.status() == reqwest::StatusCode::OK {
                ready = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(ready, "master never reported healthy over HTTP");

    let info: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/info", port))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["port"], port);

    let channel = tonic::transport::Endpoint::new(format!("http://127.0.0.1:{}", port))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut health = tonic_health::pb::health_client::HealthClient::new(channel);
    let response = health
        .check(tonic_health::pb::HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.status,
        tonic_health::pb::health_check_response::ServingStatus::Serving as i32
    );

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), master)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(MasterError::Transport(TransportError::Cancelled))
    ));
}

#[tokio::test]
async fn test_invalid_config_fails_before_binding() {
    let mut config = MasterConfig::default();
    config.port = 0;
    config.recovery.max_concurrent_restores = 0;
    let store: Arc<dyn ClusterStore> = Arc::new(SnapshotStore::in_memory());

    assert!(matches!(
        Master::new(config, store).bind().await,
        Err(MasterError::Config(_))
    ));
}

#[tokio::test]
async fn test_missing_certificate_fails_startup() {
    let mut config = MasterConfig::default();
    config.port = 0;
    config.security.tls = TlsConfig {
        cert: Some("/nonexistent/master.crt".into()),
        key: Some("/nonexistent/master.key".into()),
    };
    let store: Arc<dyn ClusterStore> = Arc::new(SnapshotStore::in_memory());

    assert!(matches!(
        Master::new(config, store).bind().await,
        Err(MasterError::Tls(_))
    ));
}
