//! Kubeconfig generation
//!
//! Regenerates the cluster's kubeconfig Secret so clients route through the
//! gateway: the server URL becomes `http://<host>:<port>/kubernetes/<tunnelID>`
//! and the admin credentials are a fresh client certificate signed by the
//! cluster's client CA (the CAPI `<cluster>-cca` Secret).

use k8s_openapi::api::core::v1::Secret;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
};

use passage_common::kubeconfig::Kubeconfig;
use passage_common::{Error, Result};

/// Key of the certificate inside CAPI certificate Secrets
pub const TLS_CRT_KEY: &str = "tls.crt";

/// Key of the private key inside CAPI certificate Secrets
pub const TLS_KEY_KEY: &str = "tls.key";

/// Validity of generated admin certificates
const CERT_VALIDITY_DAYS: i64 = 365;

/// Read a required field out of a certificate Secret
pub fn secret_field<'a>(secret: &'a Secret, key: &str) -> Result<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
        .ok_or_else(|| {
            Error::internal(format!(
                "secret {} has no {key} field",
                secret.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })
}

/// The gateway URL written into generated kubeconfigs
pub fn control_plane_endpoint_url(host: &str, port: u16, tunnel_id: &str) -> String {
    format!("http://{host}:{port}/kubernetes/{tunnel_id}")
}

/// Generate an admin kubeconfig for the cluster.
///
/// `server_ca_pem` is the remote API server CA (trusted by the client
/// through the tunnel); the client certificate is signed by the cluster's
/// client CA with `CN=kubernetes-admin, O=system:masters`.
pub fn generate_admin_kubeconfig(
    tunnel_id: &str,
    cluster_name: &str,
    server_url: &str,
    server_ca_pem: &[u8],
    client_ca_cert_pem: &str,
    client_ca_key_pem: &str,
) -> Result<String> {
    let ca_key = KeyPair::from_pem(client_ca_key_pem)
        .map_err(|e| Error::kubeconfig(tunnel_id, format!("invalid client CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(client_ca_cert_pem, ca_key)
        .map_err(|e| Error::kubeconfig(tunnel_id, format!("invalid client CA cert: {e}")))?;

    let client_key = KeyPair::generate()
        .map_err(|e| Error::kubeconfig(tunnel_id, format!("key generation failed: {e}")))?;

    let mut params = CertificateParams::new(Vec::new())
        .map_err(|e| Error::kubeconfig(tunnel_id, format!("invalid cert params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "kubernetes-admin");
    dn.push(DnType::OrganizationName, "system:masters");
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    let cert = params
        .signed_by(&client_key, &issuer)
        .map_err(|e| Error::kubeconfig(tunnel_id, format!("signing admin cert failed: {e}")))?;

    Kubeconfig::with_client_cert(
        cluster_name,
        server_url,
        server_ca_pem,
        cert.pem().as_bytes(),
        client_key.serialize_pem().as_bytes(),
    )
    .to_yaml()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use rcgen::{BasicConstraints, IsCa, KeyUsagePurpose};
    use std::collections::BTreeMap;

    fn make_ca() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "cluster-client-ca");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_control_plane_endpoint_url() {
        assert_eq!(
            control_plane_endpoint_url("gateway.internal", 8080, "c1"),
            "http://gateway.internal:8080/kubernetes/c1"
        );
    }

    #[test]
    fn test_secret_field_extraction() {
        let mut data = BTreeMap::new();
        data.insert(TLS_CRT_KEY.to_string(), ByteString(b"cert-bytes".to_vec()));
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };

        assert_eq!(secret_field(&secret, TLS_CRT_KEY).unwrap(), b"cert-bytes");
        assert!(secret_field(&secret, TLS_KEY_KEY).is_err());
    }

    #[test]
    fn test_generate_admin_kubeconfig() {
        let (ca_cert_pem, ca_key_pem) = make_ca();
        let server_url = control_plane_endpoint_url("gateway.internal", 8080, "c2");

        let yaml = generate_admin_kubeconfig(
            "c2",
            "c2",
            &server_url,
            b"server-ca-pem",
            &ca_cert_pem,
            &ca_key_pem,
        )
        .unwrap();

        let kubeconfig = Kubeconfig::from_yaml(yaml.as_bytes()).unwrap();
        assert_eq!(
            kubeconfig.clusters[0].cluster.server,
            "http://gateway.internal:8080/kubernetes/c2"
        );
        assert_eq!(kubeconfig.current_context, "c2-admin@c2");

        // The embedded client certificate must be valid PEM
        let (cert_pem, key_pem) = kubeconfig.client_cert_pem().unwrap().unwrap();
        assert!(String::from_utf8_lossy(&cert_pem).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&key_pem).contains("PRIVATE KEY"));
    }

    #[test]
    fn test_generate_rejects_garbage_ca() {
        let err = generate_admin_kubeconfig(
            "c2",
            "c2",
            "http://gw:8080/kubernetes/c2",
            b"ca",
            "not a cert",
            "not a key",
        )
        .unwrap_err();
        assert!(err.to_string().contains("client CA"));
    }
}
