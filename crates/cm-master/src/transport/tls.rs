//! Optional TLS on the base listener
//!
//! When a server certificate is configured every accepted connection is
//! wrapped in a server-side TLS session before protocol detection. The
//! handshake runs on the connection's own task, so a slow client never
//! holds up `accept` for everyone else.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use cm_core::config::{AgentResourceConfig, TlsConfig};

use super::listener::BaseListener;
use super::stream::BoxedStream;
use crate::error::TlsError;

/// Protocols offered through ALPN, most preferred first
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Server certificate chain and key loaded from PEM files
pub struct Certificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Certificate {
    /// Number of certificates in the chain
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }
}

/// Load the configured server certificate, if any
pub fn read_certificate(config: &TlsConfig) -> Result<Option<Certificate>, TlsError> {
    let (Some(cert_path), Some(key_path)) = (&config.cert, &config.key) else {
        return Ok(None);
    };

    let chain = read_certs(cert_path)?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.clone()));
    }

    let mut reader = open_pem(key_path)?;
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: key_path.clone(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.clone()))?;

    Ok(Some(Certificate { chain, key }))
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the server TLS configuration
///
/// Accepts TLS 1.2 and newer and lets the server pick the cipher suite.
/// When agents must authenticate, client certificates are requested and
/// verified if presented but never mandatory at the handshake. They are
/// checked against the configured client CA, or the platform trust store
/// when none is configured.
pub fn server_config(
    certificate: Certificate,
    agents: &AgentResourceConfig,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?;

    let builder = if agents.require_authentication {
        let roots = match &agents.client_ca {
            Some(ca_path) => {
                let roots = ca_roots(ca_path)?;
                if roots.is_empty() {
                    return Err(TlsError::NoCertificates(ca_path.clone()));
                }
                roots
            }
            None => platform_roots(),
        };

        if roots.is_empty() {
            tracing::warn!(
                "Agent authentication is required but the platform trust store is empty; client certificates will not be requested"
            );
            builder.with_no_client_auth()
        } else {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsError::ClientVerifier(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder.with_single_cert(certificate.chain, certificate.key)?;
    config.ignore_client_order = true;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

fn ca_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Trust anchors installed on this machine
fn platform_roots() -> RootCertStore {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        tracing::warn!("Failed to load platform certificate: {}", e);
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!(
        "Loaded {} platform trust anchors ({} unparseable)",
        added,
        ignored
    );
    roots
}

/// Build an acceptor from the master's TLS settings
///
/// Returns `None` when no certificate is configured. Unreadable files are
/// errors, never a silent plaintext fallback.
pub fn acceptor_from_config(
    tls: &TlsConfig,
    agents: &AgentResourceConfig,
) -> Result<Option<TlsAcceptor>, TlsError> {
    match read_certificate(tls)? {
        Some(certificate) => {
            tracing::info!(
                "TLS enabled with a {}-certificate chain",
                certificate.chain_len()
            );
            Ok(Some(TlsAcceptor::from(server_config(certificate, agents)?)))
        }
        None => Ok(None),
    }
}

/// Base listener with optional TLS termination
pub struct SecureListener {
    base: BaseListener,
    tls: Option<TlsAcceptor>,
}

impl SecureListener {
    /// Wrap a base listener; `None` serves plaintext
    pub fn new(base: BaseListener, tls: Option<TlsAcceptor>) -> Self {
        Self { base, tls }
    }

    /// Whether connections are TLS-terminated
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Effective port of the underlying listener
    pub fn port(&self) -> u16 {
        self.base.port()
    }

    /// Accept a TCP connection; the handshake is deferred to [`Pending::establish`]
    pub async fn accept(&self) -> io::Result<Pending> {
        let (tcp, peer) = self.base.accept().await?;
        Ok(Pending {
            tcp,
            peer,
            tls: self.tls.clone(),
        })
    }
}

/// Accepted connection whose TLS handshake has not run yet
pub struct Pending {
    tcp: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Pending {
    /// Remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Complete the TLS handshake, if any
    ///
    /// Fails for plaintext clients on a TLS listener.
    pub async fn establish(self) -> io::Result<BoxedStream> {
        match self.tls {
            Some(acceptor) => {
                let stream = acceptor.accept(self.tcp).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(self.tcp)),
        }
    }
}
