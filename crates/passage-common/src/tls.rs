//! TLS helpers shared by the gateway and agent
//!
//! PEM loading, root-store construction, and the explicit no-verification
//! client config behind `--insecure-skip-verify`.

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;

use crate::{Error, Result};

/// Load one or more certificates from PEM bytes
pub fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut std::io::Cursor::new(pem)).collect();
    let certs = certs.map_err(|e| Error::internal(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::internal("no certificates found in PEM data"));
    }
    Ok(certs)
}

/// Load a private key from PEM bytes (PKCS#8, PKCS#1, or SEC1)
pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut std::io::Cursor::new(pem))
        .map_err(|e| Error::internal(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| Error::internal("no private key found in PEM data"))
}

/// Build a root store from PEM-encoded CA certificates
pub fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::internal(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Root store populated with the Mozilla trust anchors
pub fn system_root_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Client config trusting the system roots
pub fn client_config_system_roots() -> ClientConfig {
    ClientConfig::builder()
        .with_root_certificates(system_root_store())
        .with_no_client_auth()
}

/// Client config that skips server certificate verification entirely.
///
/// Only reachable through an explicit `--insecure-skip-verify`; the caller is
/// expected to log a warning.
pub fn insecure_client_config() -> ClientConfig {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new(provider)))
        .with_no_client_auth()
}

/// Certificate verifier that accepts any server certificate
#[derive(Debug)]
pub struct NoCertificateVerification(CryptoProvider);

impl NoCertificateVerification {
    /// Create a verifier using the given crypto provider's schemes
    pub fn new(provider: CryptoProvider) -> Self {
        Self(provider)
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_pem() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed cert generation");
        (cert.cert.pem(), cert.signing_key.serialize_pem())
    }

    #[test]
    fn test_load_certs_rejects_empty_pem() {
        assert!(load_certs(b"").is_err());
        assert!(load_certs(b"not pem at all").is_err());
    }

    #[test]
    fn test_load_certs_parses_pem() {
        let (cert_pem, _) = self_signed_pem();
        let certs = load_certs(cert_pem.as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_load_private_key_parses_pem() {
        let (_, key_pem) = self_signed_pem();
        assert!(load_private_key(key_pem.as_bytes()).is_ok());
    }

    #[test]
    fn test_root_store_from_pem() {
        let (cert_pem, _) = self_signed_pem();
        let roots = root_store_from_pem(cert_pem.as_bytes()).unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn test_system_root_store_is_populated() {
        assert!(!system_root_store().is_empty());
    }
}
