//! TLS for negotiated iRODS channels.
//!
//! A channel starts as plain TCP and is upgraded in place once negotiation
//! settles on `CS_NEG_USE_SSL`, so both sides here work on an already
//! connected stream rather than dialing themselves.
//!
//! # Example
//!
//! ```rust,ignore
//! use irods_core::tls::{TlsSettings, TlsConnector};
//!
//! let connector = TlsConnector::new(&TlsSettings::default())?;
//! let tls = connector.connect(tcp_stream, "irods.example.org").await?;
//! ```

use std::fmt;
use std::fs;
use std::io::{self, BufReader, Cursor};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
pub use rustls::{ClientConfig, ServerConfig};

/// Client side of an upgraded channel
pub type TlsClientStream<IO> = tokio_rustls::client::TlsStream<IO>;

/// Server side of an upgraded channel
pub type TlsServerStream<IO> = tokio_rustls::server::TlsStream<IO>;

/// TLS-related errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate file not found or unreadable
    #[error("Failed to read certificate file '{path}': {source}")]
    CertificateReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid certificate format: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key format: {0}")]
    InvalidPrivateKey(String),

    #[error("TLS handshake failed: {0}")]
    HandshakeError(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to generate self-signed certificate: {0}")]
    SelfSignedGenerationError(String),

    #[error("TLS internal error: {0}")]
    RustlsError(String),
}

impl From<rustls::Error> for TlsError {
    fn from(err: rustls::Error) -> Self {
        TlsError::RustlsError(err.to_string())
    }
}

/// Result type for TLS operations
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Where trusted CA certificates come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CertificateSource {
    /// PEM file on disk
    File { path: PathBuf },
    /// Inline PEM
    Pem { content: String },
}

/// Client TLS settings used when a channel negotiates SSL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TlsSettings {
    /// Trusted CA certificates; the platform trust store when absent
    #[serde(default)]
    pub root_ca: Option<CertificateSource>,

    /// Accept any server certificate. Test servers only.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// SNI / verification name; the account host when absent
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsSettings {
    /// Settings trusting the given CA file
    pub fn with_root_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.root_ca = Some(CertificateSource::File { path: path.into() });
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Disable certificate verification (local test servers)
    pub fn insecure(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }
}

/// Load certificates from a source
pub fn load_certificates(source: &CertificateSource) -> TlsResult<Vec<CertificateDer<'static>>> {
    match source {
        CertificateSource::File { path } => {
            let data = fs::read(path).map_err(|e| TlsError::CertificateReadError {
                path: path.clone(),
                source: e,
            })?;
            parse_pem_certificates(&data)
        }
        CertificateSource::Pem { content } => parse_pem_certificates(content.as_bytes()),
    }
}

fn parse_pem_certificates(data: &[u8]) -> TlsResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(data));
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(format!("Failed to parse PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "No certificates found in PEM data".to_string(),
        ));
    }

    Ok(certs)
}

/// Parse a PEM-encoded private key
pub fn parse_pem_private_key(data: &[u8]) -> TlsResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(Cursor::new(data));

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidPrivateKey(format!("Failed to parse PEM: {}", e)))?
        .ok_or_else(|| TlsError::InvalidPrivateKey("No private key found in PEM data".to_string()))
}

/// Self-signed certificate and key, with the certificate also returned as
/// PEM so clients can trust it
pub struct SelfSigned {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
    pub cert_pem: String,
}

/// Generate a self-signed certificate for local and test servers
pub fn generate_self_signed(common_name: &str) -> TlsResult<SelfSigned> {
    let subject_alt_names = vec![
        common_name.to_string(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ];

    let mut cert_params = rcgen::CertificateParams::new(subject_alt_names)
        .map_err(|e| TlsError::SelfSignedGenerationError(e.to_string()))?;
    cert_params.distinguished_name = rcgen::DistinguishedName::new();
    cert_params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(common_name.to_string()),
    );

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| TlsError::SelfSignedGenerationError(e.to_string()))?;
    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::SelfSignedGenerationError(e.to_string()))?;

    Ok(SelfSigned {
        cert: CertificateDer::from(cert.der().to_vec()),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        cert_pem: cert.pem(),
    })
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS connector used to upgrade an established client socket
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

impl TlsConnector {
    pub fn new(settings: &TlsSettings) -> TlsResult<Self> {
        let client_config = build_client_config(settings)?;
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
            server_name: settings.server_name.clone(),
        })
    }

    /// Run the TLS handshake over `stream`. The configured server name
    /// overrides `host` for SNI and verification.
    pub async fn connect<IO>(&self, stream: IO, host: &str) -> TlsResult<TlsClientStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = self.server_name.as_deref().unwrap_or(host);
        let name: rustls::pki_types::ServerName<'static> = server_name
            .to_string()
            .try_into()
            .map_err(|_| TlsError::ConfigError(format!("Invalid server name: {}", server_name)))?;

        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| TlsError::HandshakeError(e.to_string()))
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn build_client_config(settings: &TlsSettings) -> TlsResult<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    if settings.insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth());
    }

    let mut store = rustls::RootCertStore::empty();
    match &settings.root_ca {
        Some(source) => {
            for cert in load_certificates(source)? {
                store.add(cert).map_err(|e| {
                    TlsError::InvalidCertificate(format!("Failed to add root CA: {}", e))
                })?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                let _ = store.add(cert);
            }
        }
    }

    Ok(builder.with_root_certificates(store).with_no_client_auth())
}

/// Accepts any server certificate. Only for test servers.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-side acceptor, used by local test servers to answer an SSL
/// negotiation
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> TlsResult<Self> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Acceptor with a freshly generated certificate; returns the
    /// certificate PEM for clients to trust
    pub fn self_signed(common_name: &str) -> TlsResult<(Self, String)> {
        let generated = generate_self_signed(common_name)?;
        let acceptor = Self::new(vec![generated.cert], generated.key)?;
        Ok((acceptor, generated.cert_pem))
    }

    pub async fn accept<IO>(&self, stream: IO) -> TlsResult<TlsServerStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::HandshakeError(e.to_string()))
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_generate_self_signed() {
        let generated = generate_self_signed("irods.test").unwrap();
        assert!(!generated.cert.is_empty());
        assert!(generated.cert_pem.contains("BEGIN CERTIFICATE"));
        let parsed = load_certificates(&CertificateSource::Pem {
            content: generated.cert_pem,
        })
        .unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_load_certificates_from_file() {
        let generated = generate_self_signed("irods.test").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, &generated.cert_pem).unwrap();

        let certs = load_certificates(&CertificateSource::File { path }).unwrap();
        assert_eq!(certs.len(), 1);

        let missing = load_certificates(&CertificateSource::File {
            path: dir.path().join("absent.pem"),
        });
        assert!(matches!(
            missing,
            Err(TlsError::CertificateReadError { .. })
        ));
    }

    #[test]
    fn test_invalid_pem() {
        let result = load_certificates(&CertificateSource::Pem {
            content: "not a certificate".into(),
        });
        assert!(matches!(result, Err(TlsError::InvalidCertificate(_))));
        assert!(parse_pem_private_key(b"nothing").is_err());
    }

    #[test]
    fn test_settings_serde() {
        let settings = TlsSettings::default()
            .with_root_ca_file("/etc/irods/ca.pem")
            .with_server_name("irods.example.org");
        let json = serde_json::to_string(&settings).unwrap();
        let back: TlsSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
        assert!(!back.insecure_skip_verify);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (acceptor, pem) = TlsAcceptor::self_signed("localhost").unwrap();
        let settings = TlsSettings {
            root_ca: Some(CertificateSource::Pem { content: pem }),
            ..Default::default()
        };
        let connector = TlsConnector::new(&settings).unwrap();

        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(async move {
            let mut tls = acceptor.accept(server).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut tls = connector.connect(client, "localhost").await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_certificate_rejected() {
        let (acceptor, _pem) = TlsAcceptor::self_signed("localhost").unwrap();
        let other = generate_self_signed("other").unwrap();
        let settings = TlsSettings {
            root_ca: Some(CertificateSource::Pem {
                content: other.cert_pem,
            }),
            ..Default::default()
        };
        let connector = TlsConnector::new(&settings).unwrap();

        let (client, server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = acceptor.accept(server).await;
        });

        let result = connector.connect(client, "localhost").await;
        assert!(matches!(result, Err(TlsError::HandshakeError(_))));
    }
}
