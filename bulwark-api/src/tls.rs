//! TLS server setup and client-certificate identity derivation.
//!
//! Client certificates are requested but not chain-verified: the SPKI
//! digest plus the policy lookup is the authorization root. A connection
//! without a certificate is admitted and carries the `unknown` identity,
//! which fails at the authorization gate.

use bulwark_keystore::Identity;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigError;

// ---------------------------------------------------------------------------
// Identity derivation
// ---------------------------------------------------------------------------

/// Identity of a DER-encoded certificate: lowercase hex SHA-256 over its
/// `SubjectPublicKeyInfo`.
pub fn identity_from_cert_der(der: &[u8]) -> Option<Identity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    Some(Identity::from_spki_der(cert.public_key().raw))
}

/// Identity of the TLS peer, or `unknown` when no usable certificate was
/// presented.
pub fn peer_identity(conn: &rustls::ServerConnection) -> Identity {
    conn.peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| identity_from_cert_der(cert.as_ref()))
        .unwrap_or_else(Identity::unknown)
}

// ---------------------------------------------------------------------------
// Client-certificate admission
// ---------------------------------------------------------------------------

/// Accepts any syntactically valid client certificate and lets connections
/// without one proceed as `unknown`.
#[derive(Debug)]
struct AnyClientCert {
    supported: WebPkiSupportedAlgorithms,
}

impl AnyClientCert {
    fn new() -> Self {
        Self {
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// Build the rustls server configuration: TLS 1.2+, client certificates
/// requested, HTTP/1.1 and HTTP/2 via ALPN.
pub fn server_config(key: &Path, cert: &Path) -> Result<rustls::ServerConfig, ConfigError> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| ConfigError::Invalid(format!("tls versions: {}", e)))?
        .with_client_cert_verifier(Arc::new(AnyClientCert::new()))
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Invalid(format!("tls key/cert: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| ConfigError::Invalid(format!("{}: no private key found", path.display())))
}
