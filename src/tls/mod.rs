//! TLS support for the BasicStation listener.
//!
//! Provides:
//! - Certificate and key loading from PEM files
//! - rustls `ServerConfig` assembly, with client-certificate verification
//!   against a CA when one is configured
//! - A connection acceptor that surfaces the verified client certificate's
//!   Subject Common Name to request handlers, where it is matched against
//!   the connecting gateway's EUI

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::middleware::AddExtension;
use axum::Extension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures_util::future::BoxFuture;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::debug;

/// Errors that can occur during TLS setup
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read certificate file {path}: {message}")]
    CertReadError { path: String, message: String },

    #[error("Failed to read key file {path}: {message}")]
    KeyReadError { path: String, message: String },

    #[error("No certificates found in PEM file: {0}")]
    NoCertsFound(String),

    #[error("No private key found in PEM file: {0}")]
    NoKeyFound(String),

    #[error("Failed to build TLS config: {0}")]
    ConfigBuildError(String),
}

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
        .map_err(|e| TlsError::CertReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertsFound(path.display().to_string()));
    }

    debug!(
        "Loaded {} certificate(s) from {}",
        certs.len(),
        path.display()
    );
    Ok(certs)
}

/// Load a private key from a PEM file.
///
/// Supports PKCS#8 and RSA/EC keys.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    match PrivateKeyDer::from_pem_file(path) {
        Ok(key) => {
            debug!("Loaded private key from {}", path.display());
            Ok(key)
        }
        Err(rustls_pki_types::pem::Error::NoItemsFound) => {
            Err(TlsError::NoKeyFound(path.display().to_string()))
        }
        Err(e) => Err(TlsError::KeyReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

/// Assemble the listener's rustls config.
///
/// With a CA certificate, client certificates are required and verified
/// against it; without one, clients connect anonymously.
pub fn build_server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_cert_path: Option<&Path>,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    // Ensure a crypto provider is installed (required by rustls 0.23+).
    // Idempotent; if already installed, the Err is ignored.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let server_config = match ca_cert_path {
        Some(ca_path) => {
            let ca_certs = load_certs(ca_path)?;
            let mut root_store = rustls::RootCertStore::empty();
            for ca_cert in ca_certs {
                root_store.add(ca_cert).map_err(|e| {
                    TlsError::ConfigBuildError(format!("failed to add CA cert: {}", e))
                })?;
            }

            let client_verifier =
                rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
                    .build()
                    .map_err(|e| {
                        TlsError::ConfigBuildError(format!(
                            "failed to build client verifier: {}",
                            e
                        ))
                    })?;

            rustls::ServerConfig::builder()
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
                .map_err(|e| TlsError::ConfigBuildError(e.to_string()))?
        }
        None => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::ConfigBuildError(e.to_string()))?,
    };

    Ok(Arc::new(server_config))
}

/// Identity material of a TLS peer, attached to every request served over
/// a connection that presented a client certificate.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate {
    /// Subject Common Name of the verified client certificate.
    pub common_name: Option<String>,
}

/// Subject Common Name of a DER-encoded certificate.
pub fn peer_common_name(cert_der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref()).ok()?;
    for cn in cert.subject().iter_common_name() {
        if let Ok(s) = cn.as_str() {
            return Some(s.to_string());
        }
    }
    None
}

/// TLS acceptor that performs the rustls handshake and then injects the
/// peer certificate's Common Name as a request extension.
#[derive(Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
}

impl ClientCertAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        ClientCertAcceptor {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(config)),
        }
    }
}

impl<I, S> Accept<I, S> for ClientCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificate>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let (_, conn) = stream.get_ref();
            let common_name = conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(peer_common_name);

            let service = Extension(PeerCertificate { common_name }).layer(service);
            Ok((stream, service))
        })
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use tempfile::TempDir;

    use super::*;

    fn generate_ca() -> (rcgen::Certificate, KeyPair) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "lorabridge test CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn issue_cert(
        cn: &str,
        ca: &rcgen::Certificate,
        ca_key: &KeyPair,
    ) -> (rcgen::Certificate, KeyPair) {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, ca, ca_key).unwrap();
        (cert, key)
    }

    #[test]
    fn common_name_is_extracted_from_der() {
        let (ca, ca_key) = generate_ca();
        let (cert, _) = issue_cert("0102030405060708", &ca, &ca_key);
        let der = CertificateDer::from(cert.der().to_vec());
        assert_eq!(
            peer_common_name(&der),
            Some("0102030405060708".to_string())
        );
    }

    #[test]
    fn server_config_without_ca() {
        let dir = TempDir::new().unwrap();
        let (ca, ca_key) = generate_ca();
        let (cert, key) = issue_cert("server", &ca, &ca_key);

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        let config = build_server_config(&cert_path, &key_path, None).unwrap();
        // No client verification configured.
        assert!(!config.ignore_client_order);
    }

    #[test]
    fn server_config_with_ca_requires_client_certs() {
        let dir = TempDir::new().unwrap();
        let (ca, ca_key) = generate_ca();
        let (cert, key) = issue_cert("server", &ca, &ca_key);

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        std::fs::write(&ca_path, ca.pem()).unwrap();

        build_server_config(&cert_path, &key_path, Some(&ca_path)).unwrap();
    }

    #[test]
    fn missing_files_error() {
        assert!(matches!(
            load_certs(Path::new("/nonexistent/cert.pem")),
            Err(TlsError::CertReadError { .. })
        ));
        assert!(load_private_key(Path::new("/nonexistent/key.pem")).is_err());
    }

    #[test]
    fn empty_pem_files_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            load_certs(&path),
            Err(TlsError::NoCertsFound(_))
        ));
        assert!(matches!(
            load_private_key(&path),
            Err(TlsError::NoKeyFound(_))
        ));
    }
}
