//! rustls plumbing for TLS-wrapped transports

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::stream::{Backend, StreamTransport};
use crate::transport::{TransportError, TransportResult};

/// Transport for a connection we accepted and terminated TLS on
pub type TlsServerTransport = StreamTransport<server::TlsStream<TcpStream>>;

/// Transport for a connection we opened to a TLS upstream
pub type TlsClientTransport = StreamTransport<client::TlsStream<TcpStream>>;

/// The process-wide rustls provider, installing ring if nothing else has
fn crypto_provider() -> Arc<CryptoProvider> {
    if CryptoProvider::get_default().is_none() {
        // Another thread may win the race; its provider is used instead
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Build an acceptor from PEM files on disk
pub fn acceptor_from_pem_files(
    cert_path: &Path,
    key_path: &Path,
) -> TransportResult<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    acceptor_from_der(certs, key)
}

pub fn acceptor_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> TransportResult<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::TlsError(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a connector for upstream TLS.
///
/// With no `extra_roots` the webpki roots are trusted. `insecure` accepts
/// any upstream certificate.
pub fn connector(
    extra_roots: Vec<CertificateDer<'static>>,
    insecure: bool,
) -> TransportResult<TlsConnector> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::TlsError(e.to_string()))?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                algorithms: provider.signature_verification_algorithms,
            }))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if extra_roots.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in extra_roots {
                roots.add(cert).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                })?;
            }
        }
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the server-side handshake on an accepted socket
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> TransportResult<TlsServerTransport> {
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;
    let tls_stream = acceptor.accept(stream).await.map_err(|e| {
        TransportError::TlsError(format!("Handshake with {} failed: {}", peer_addr, e))
    })?;

    debug!("TLS handshake completed with {}", peer_addr);
    Ok(StreamTransport::new(tls_stream, Backend::Tls).with_peer_addr(peer_addr))
}

/// Connect to `addr` and run the client-side handshake for `server_name`
pub async fn connect(
    connector: &TlsConnector,
    addr: SocketAddr,
    server_name: &str,
) -> TransportResult<TlsClientTransport> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
        TransportError::ConfigurationError(format!("Invalid server name {}: {}", server_name, e))
    })?;

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let tls_stream = connector.connect(name, stream).await.map_err(|e| {
        TransportError::TlsError(format!("Handshake with {} failed: {}", addr, e))
    })?;

    debug!("TLS connection established to {} ({})", addr, server_name);
    Ok(StreamTransport::new(tls_stream, Backend::Tls).with_peer_addr(addr))
}

fn open_pem(path: &Path) -> TransportResult<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        TransportError::TlsError(format!("Cannot open {}: {}", path.display(), e))
    })
}

pub fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Bad PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| TransportError::TlsError(format!("Bad PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| TransportError::TlsError(format!("No private key in {}", path.display())))
}

/// Accepts any upstream certificate chain. Handshake signatures are still
/// checked against the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
