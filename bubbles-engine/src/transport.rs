//! Transport setup: TCP, optional mutual TLS, then a WebSocket upgrade.
//!
//! Both ends verify each other against the same authority certificate.
//! The crypto provider is passed explicitly, so nothing is installed
//! process-wide.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::WebSocketStream;
use zeroize::Zeroizing;

use crate::error::EngineError;

/// Any byte stream a WebSocket can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// WebSocket over a plain or TLS stream.
pub type WsStream = WebSocketStream<Box<dyn Transport>>;

/// PEM text supplied by the embedder.
#[derive(Clone, Default)]
pub struct CredentialBundle {
    ca_cert_pem: String,
    cert_pem: String,
    key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("ca_cert_pem", &self.ca_cert_pem.len())
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

struct ParsedCredentials {
    roots: RootCertStore,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CredentialBundle {
    pub fn new(
        ca_cert_pem: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        Self {
            ca_cert_pem: ca_cert_pem.into(),
            cert_pem: cert_pem.into(),
            key_pem: Zeroizing::new(key_pem.into()),
        }
    }

    fn parse(&self) -> Result<ParsedCredentials, EngineError> {
        if self.ca_cert_pem.trim().is_empty() {
            return Err(EngineError::Credential("authority certificate is empty".into()));
        }
        if self.cert_pem.trim().is_empty() {
            return Err(EngineError::Credential("certificate is empty".into()));
        }
        if self.key_pem.trim().is_empty() {
            return Err(EngineError::Credential("private key is empty".into()));
        }

        let authorities = parse_certificates(&self.ca_cert_pem, "authority certificate")?;
        let mut roots = RootCertStore::empty();
        for cert in authorities {
            roots.add(cert).map_err(|e| {
                EngineError::Credential(format!("unusable authority certificate: {e}"))
            })?;
        }

        let chain = parse_certificates(&self.cert_pem, "certificate")?;
        let key = PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
            .map_err(|e| EngineError::Credential(format!("failed to parse private key: {e}")))?;

        Ok(ParsedCredentials { roots, chain, key })
    }
}

fn parse_certificates(
    pem: &str,
    what: &str,
) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Credential(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(EngineError::Credential(format!("no {what} found in PEM")));
    }
    Ok(certs)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client side of mutual TLS.
#[derive(Clone)]
pub struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTls {
    /// Build from PEM credentials. `server_name` is the name the relay
    /// certificate must carry.
    pub fn new(credentials: &CredentialBundle, server_name: &str) -> Result<Self, EngineError> {
        let parsed = credentials.parse()?;
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| EngineError::Credential(format!("invalid server name: {e}")))?;

        let config = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| EngineError::Credential(format!("TLS setup failed: {e}")))?
            .with_root_certificates(parsed.roots)
            .with_client_auth_cert(parsed.chain, parsed.key)
            .map_err(|e| EngineError::Credential(format!("client certificate rejected: {e}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// Relay side of mutual TLS: client certificates are mandatory.
#[derive(Clone)]
pub struct ServerTls {
    acceptor: TlsAcceptor,
}

impl ServerTls {
    pub fn new(credentials: &CredentialBundle) -> Result<Self, EngineError> {
        let parsed = credentials.parse()?;
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(parsed.roots), provider())
                .build()
                .map_err(|e| EngineError::Credential(format!("client verifier error: {e}")))?;

        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| EngineError::Credential(format!("TLS setup failed: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(parsed.chain, parsed.key)
            .map_err(|e| EngineError::Credential(format!("server certificate rejected: {e}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

/// Normalize an endpoint to `host:port`, adding `default_port` if missing.
pub fn resolve_address(endpoint: &str, default_port: u16) -> Result<String, EngineError> {
    let endpoint = endpoint.trim();
    let endpoint = endpoint
        .strip_prefix("ws://")
        .or_else(|| endpoint.strip_prefix("wss://"))
        .unwrap_or(endpoint)
        .trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(EngineError::Connect("endpoint is empty".into()));
    }

    // Bracketed IPv6, with or without a port.
    if let Some(rest) = endpoint.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(EngineError::Connect(format!("invalid endpoint {endpoint:?}")));
        };
        if host.is_empty() {
            return Err(EngineError::Connect(format!("invalid endpoint {endpoint:?}")));
        }
        return match tail.strip_prefix(':') {
            None if tail.is_empty() => Ok(format!("[{host}]:{default_port}")),
            Some(port) => Ok(format!("[{host}]:{}", parse_port(port, endpoint)?)),
            None => Err(EngineError::Connect(format!("invalid endpoint {endpoint:?}"))),
        };
    }

    match endpoint.rsplit_once(':') {
        None => Ok(format!("{endpoint}:{default_port}")),
        // Bare IPv6 literal.
        Some((host, _)) if host.contains(':') => Ok(format!("[{endpoint}]:{default_port}")),
        Some((host, port)) => {
            if host.is_empty() {
                return Err(EngineError::Connect(format!("invalid endpoint {endpoint:?}")));
            }
            Ok(format!("{host}:{}", parse_port(port, endpoint)?))
        }
    }
}

fn parse_port(port: &str, endpoint: &str) -> Result<u16, EngineError> {
    port.parse::<u16>()
        .map_err(|_| EngineError::Connect(format!("invalid port in endpoint {endpoint:?}")))
}

/// Connect to `address`, run TLS if configured, then upgrade to WebSocket.
///
/// The whole sequence is bounded by `connect_timeout`.
pub async fn dial(
    address: &str,
    tls: Option<&ClientTls>,
    connect_timeout: Duration,
) -> Result<WsStream, EngineError> {
    timeout(connect_timeout, dial_inner(address, tls))
        .await
        .map_err(|_| EngineError::Connect(format!("connecting to {address} timed out")))?
}

async fn dial_inner(address: &str, tls: Option<&ClientTls>) -> Result<WsStream, EngineError> {
    let tcp = TcpStream::connect(address)
        .await
        .map_err(|e| EngineError::Connect(format!("{address}: {e}")))?;
    let _ = tcp.set_nodelay(true);

    let stream: Box<dyn Transport> = match tls {
        Some(tls) => {
            let stream = tls
                .connector
                .connect(tls.server_name.clone(), tcp)
                .await
                .map_err(|e| EngineError::Connect(format!("TLS handshake failed: {e}")))?;
            Box::new(stream)
        }
        None => Box::new(tcp),
    };

    let url = format!("ws://{address}/");
    let (ws, _response) = tokio_tungstenite::client_async(url, stream)
        .await
        .map_err(|e| EngineError::Connect(format!("WebSocket upgrade failed: {e}")))?;
    log::debug!("Connected to {address} (tls: {})", tls.is_some());
    Ok(ws)
}

/// Accept side of [`dial`], bounded by `handshake_timeout`.
pub async fn accept(
    tcp: TcpStream,
    tls: Option<&ServerTls>,
    handshake_timeout: Duration,
) -> Result<WsStream, EngineError> {
    timeout(handshake_timeout, accept_inner(tcp, tls))
        .await
        .map_err(|_| EngineError::Connect("transport handshake timed out".into()))?
}

async fn accept_inner(tcp: TcpStream, tls: Option<&ServerTls>) -> Result<WsStream, EngineError> {
    let _ = tcp.set_nodelay(true);
    let stream: Box<dyn Transport> = match tls {
        Some(tls) => {
            let stream = tls
                .acceptor
                .accept(tcp)
                .await
                .map_err(|e| EngineError::Connect(format!("TLS accept failed: {e}")))?;
            Box::new(stream)
        }
        None => Box::new(tcp),
    };
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(ws)
}
