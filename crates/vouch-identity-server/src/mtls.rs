//! TLS serving with client-certificate extraction.
//!
//! Wraps the TCP listener in a rustls acceptor and surfaces the peer's
//! certificate (when presented) plus its direct socket address through
//! axum's connect-info machinery. Clients without a certificate still pass
//! the handshake; endpoints that need one reject in the handler, so public
//! endpoints like the JWKS stay reachable. A wrong certificate still fails
//! the handshake early against the trust pool.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::connect_info::Connected;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, warn};

use vouch_pki::cert::CertificatePem;

use crate::error::IdentityError;

/// Peer address and client certificate of an accepted connection.
#[derive(Clone, Debug)]
pub struct TlsConnectInfo {
    /// The direct network peer. Forwarded-for headers are never consulted.
    pub peer_addr: SocketAddr,
    /// DER of the peer certificate, if one was presented.
    pub client_cert_der: Option<Vec<u8>>,
}

/// Builds the server TLS configuration.
///
/// With `client_roots`, client certificates are verified against the pool
/// when presented but remain optional; without it, no client authentication
/// happens at the TLS layer at all (JWKS-only mode).
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
    client_roots: Option<&[CertificatePem]>,
) -> Result<ServerConfig, IdentityError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
        IdentityError::Internal(format!("failed to read {}: {e}", cert_path.display()))
    })?;
    let chain: Vec<CertificateDer<'static>> = CertificatePem::parse_chain_pem(&cert_pem)
        .map_err(|e| IdentityError::Internal(e.to_string()))?
        .into_iter()
        .map(|cert| CertificateDer::from(cert.der().to_vec()))
        .collect();
    if chain.is_empty() {
        return Err(IdentityError::Internal(format!(
            "{} contains no certificate",
            cert_path.display()
        )));
    }

    let key = private_key_from_pem_file(key_path)?;

    let builder = match client_roots {
        Some(roots) => {
            let mut store = RootCertStore::empty();
            for root in roots {
                store
                    .add(CertificateDer::from(root.der().to_vec()))
                    .map_err(|e| {
                        IdentityError::Internal(format!("failed to add client root cert: {e}"))
                    })?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(store))
                .allow_unauthenticated()
                .build()
                .map_err(|e| {
                    IdentityError::Internal(format!("failed to build client verifier: {e}"))
                })?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    builder
        .with_single_cert(chain, key)
        .map_err(|e| IdentityError::Internal(format!("failed to build server config: {e}")))
}

fn private_key_from_pem_file(path: &Path) -> Result<PrivateKeyDer<'static>, IdentityError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| IdentityError::Internal(format!("failed to read {}: {e}", path.display())))?;
    let block = pem::parse(&raw)
        .map_err(|e| IdentityError::Internal(format!("invalid key PEM {}: {e}", path.display())))?;

    let der = block.contents().to_vec();
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(der.into())),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(der.into())),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(der.into())),
        other => Err(IdentityError::Internal(format!(
            "unsupported private key PEM type {other}"
        ))),
    }
}

/// TCP listener wrapping every connection in TLS.
pub struct MtlsListener {
    tcp: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
}

impl MtlsListener {
    /// Creates a listener from a bound socket and a server configuration.
    pub fn new(tcp: TcpListener, config: ServerConfig) -> Self {
        Self {
            tcp,
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        }
    }
}

/// A TLS stream carrying its connection info.
pub struct MtlsStream {
    inner: TlsStream<TcpStream>,
    connect_info: TlsConnectInfo,
}

impl tokio::io::AsyncRead for MtlsStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for MtlsStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl axum::serve::Listener for MtlsListener {
    type Io = MtlsStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.tcp.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted TCP connection");
                    match self.acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let client_cert_der = peer_certificate(&tls_stream);
                            let connect_info = TlsConnectInfo {
                                peer_addr: addr,
                                client_cert_der,
                            };
                            return (
                                MtlsStream {
                                    inner: tls_stream,
                                    connect_info,
                                },
                                addr,
                            );
                        }
                        Err(err) => {
                            warn!(peer = %addr, error = %err, "TLS handshake failed");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "TCP accept error");
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

impl Connected<axum::serve::IncomingStream<'_, MtlsListener>> for TlsConnectInfo {
    fn connect_info(target: axum::serve::IncomingStream<'_, MtlsListener>) -> Self {
        target.io().connect_info.clone()
    }
}

/// Extracts the end-entity peer certificate from a finished handshake.
fn peer_certificate(tls_stream: &TlsStream<TcpStream>) -> Option<Vec<u8>> {
    let (_, connection) = tls_stream.get_ref();
    let certs = connection.peer_certificates()?;
    certs.first().map(|cert| cert.as_ref().to_vec())
}
