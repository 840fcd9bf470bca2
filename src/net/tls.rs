//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Build the acceptor used by `protocol = "tls"` listeners
//! - Build the connector used when dialing backends over TLS
//! - Optionally skip backend certificate verification

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::schema::{BackendTlsConfig, TlsConfig};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("root_ca_cert_path is required unless ignore_verify is set")]
    MissingRootCa,
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

/// Build the listener-side acceptor.
pub fn build_acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&cfg.cert_path)?;
    let key = load_private_key(&cfg.key_path)?;

    let versions: &[&'static rustls::SupportedProtocolVersion] =
        match (cfg.min_version.as_str(), cfg.max_version.as_str()) {
            ("tls13", _) => &[&rustls::version::TLS13],
            (_, "tls12") => &[&rustls::version::TLS12],
            _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
        };

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(versions)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    tracing::info!(
        min_version = %cfg.min_version,
        max_version = %cfg.max_version,
        "TLS listener configured"
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the backend-side connector.
pub fn build_connector(cfg: &BackendTlsConfig) -> Result<TlsConnector, TlsError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = if cfg.ignore_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
    } else {
        let path = cfg.root_ca_cert_path.as_deref().ok_or(TlsError::MissingRootCa)?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(path)? {
            roots.add(cert)?;
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name used to verify a backend: explicit override, backend SNI, then host.
pub fn server_name(
    cfg: &BackendTlsConfig,
    backend_sni: Option<&str>,
    host: &str,
) -> Result<ServerName<'static>, TlsError> {
    let name = cfg
        .server_name
        .as_deref()
        .or(backend_sni.filter(|s| !s.is_empty()))
        .unwrap_or(host)
        .to_string();
    ServerName::try_from(name.clone()).map_err(|_| TlsError::ServerName(name))
}

/// Accepts any backend certificate.
#[derive(Debug)]
struct NoVerify {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerify {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported() {
        let cfg = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            min_version: "tls12".into(),
            max_version: "tls13".into(),
        };
        assert!(matches!(build_acceptor(&cfg), Err(TlsError::Io { .. })));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert!(matches!(load_certs(path), Err(TlsError::NoCertificates(_))));
        assert!(matches!(load_private_key(path), Err(TlsError::NoPrivateKey(_))));
    }

    #[test]
    fn verifying_connector_needs_roots() {
        let cfg = BackendTlsConfig::default();
        assert!(matches!(build_connector(&cfg), Err(TlsError::MissingRootCa)));
    }

    #[test]
    fn insecure_connector_builds() {
        let cfg = BackendTlsConfig {
            ignore_verify: true,
            ..BackendTlsConfig::default()
        };
        assert!(build_connector(&cfg).is_ok());
    }

    #[test]
    fn server_name_precedence() {
        let mut cfg = BackendTlsConfig::default();
        let name = server_name(&cfg, Some("api.example.com"), "10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "api.example.com");

        let name = server_name(&cfg, None, "10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "10.0.0.1");

        cfg.server_name = Some("internal.example.com".into());
        let name = server_name(&cfg, Some("api.example.com"), "10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "internal.example.com");
    }
}
