//! Kubeconfig resolution for the data path
//!
//! The per-tunnel HTTP client needs TLS material (remote server CA plus
//! admin client certificate) to speak end-to-end TLS to the remote API
//! server through the tunnel. That material lives in the kubeconfig Secret
//! referenced by labels on the ClusterConnect; it is parsed once and cached
//! in-process keyed by tunnel id.

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use rustls::ClientConfig;
use tracing::{debug, info};

use passage_common::crd::ClusterConnect;
use passage_common::kubeconfig::Kubeconfig;
use passage_common::{
    tls, Error, Result, KUBECONFIG_DATA_KEY, KUBECONFIG_NAMESPACE_LABEL, KUBECONFIG_NAME_LABEL,
};

use crate::metrics::KUBECONFIG_RETRIEVAL_DURATION;

/// TLS material derived from a tunnel's kubeconfig
#[derive(Debug)]
pub struct TlsMaterial {
    /// Client config for the in-tunnel TLS connection to the remote API
    /// server. ALPN is pinned to HTTP/1.1 so upgrade requests keep working.
    pub client_config: Arc<ClientConfig>,
}

/// Resolves and caches per-tunnel TLS material
pub struct KubeconfigResolver {
    client: Client,
    cache: DashMap<String, Arc<TlsMaterial>>,
    insecure_skip_verify: bool,
}

impl KubeconfigResolver {
    /// Create a resolver. With `insecure_skip_verify`, the remote API
    /// server's certificate is not verified (client certs are still sent).
    pub fn new(client: Client, insecure_skip_verify: bool) -> Self {
        Self {
            client,
            cache: DashMap::new(),
            insecure_skip_verify,
        }
    }

    /// Resolve the TLS material for a tunnel, from cache or the durable
    /// store
    pub async fn resolve(&self, tunnel_id: &str) -> Result<Arc<TlsMaterial>> {
        if let Some(cached) = self.cache.get(tunnel_id) {
            return Ok(cached.clone());
        }

        let timer = KUBECONFIG_RETRIEVAL_DURATION.start_timer();
        let kubeconfig = self.fetch_kubeconfig(tunnel_id).await;
        timer.observe_duration();
        let kubeconfig = kubeconfig?;

        let material = Arc::new(self.build_material(tunnel_id, &kubeconfig)?);
        self.cache.insert(tunnel_id.to_string(), material.clone());
        info!(tunnel_id = %tunnel_id, "Resolved kubeconfig TLS material");
        Ok(material)
    }

    /// Drop the cached entry for a tunnel. Called when the durable record
    /// changes and by the eviction sweeper when the session disappears.
    pub fn invalidate(&self, tunnel_id: &str) {
        if self.cache.remove(tunnel_id).is_some() {
            debug!(tunnel_id = %tunnel_id, "Invalidated cached kubeconfig");
        }
    }

    async fn fetch_kubeconfig(&self, tunnel_id: &str) -> Result<Kubeconfig> {
        // The ClusterConnect's labels name the kubeconfig Secret
        let connects: Api<ClusterConnect> = Api::all(self.client.clone());
        let cc = connects.get(tunnel_id).await.map_err(|e| {
            Error::kubeconfig(tunnel_id, format!("failed to get ClusterConnect: {e}"))
        })?;

        let labels = cc.metadata.labels.as_ref();
        let (name, namespace) = match (
            labels.and_then(|l| l.get(KUBECONFIG_NAME_LABEL)),
            labels.and_then(|l| l.get(KUBECONFIG_NAMESPACE_LABEL)),
        ) {
            (Some(name), Some(namespace)) => (name.clone(), namespace.clone()),
            _ => {
                return Err(Error::kubeconfig(
                    tunnel_id,
                    "ClusterConnect has no kubeconfig labels yet",
                ))
            }
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets.get(&name).await.map_err(|e| {
            Error::kubeconfig(
                tunnel_id,
                format!("failed to get kubeconfig secret {namespace}/{name}: {e}"),
            )
        })?;

        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_DATA_KEY))
            .ok_or_else(|| {
                Error::kubeconfig(
                    tunnel_id,
                    format!("secret {namespace}/{name} has no {KUBECONFIG_DATA_KEY} field"),
                )
            })?;

        Kubeconfig::from_yaml(&data.0)
    }

    fn build_material(&self, tunnel_id: &str, kubeconfig: &Kubeconfig) -> Result<TlsMaterial> {
        let client_auth = kubeconfig
            .client_cert_pem()?
            .map(|(cert_pem, key_pem)| -> Result<_> {
                Ok((tls::load_certs(&cert_pem)?, tls::load_private_key(&key_pem)?))
            })
            .transpose()?;

        let builder = if self.insecure_skip_verify {
            ClientConfig::builder().dangerous().with_custom_certificate_verifier(Arc::new(
                tls::NoCertificateVerification::new(rustls::crypto::aws_lc_rs::default_provider()),
            ))
        } else {
            let ca_pem = kubeconfig.server_ca_pem()?.ok_or_else(|| {
                Error::kubeconfig(tunnel_id, "kubeconfig has no certificate-authority-data")
            })?;
            let roots = tls::root_store_from_pem(&ca_pem)?;
            ClientConfig::builder().with_root_certificates(roots)
        };

        let mut config = match client_auth {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key).map_err(|e| {
                Error::kubeconfig(tunnel_id, format!("invalid client certificate: {e}"))
            })?,
            None => builder.with_no_client_auth(),
        };

        // Never negotiate HTTP/2 on the transport that carries upgrade
        // requests; the inner client speaks HTTP/1.1
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsMaterial {
            client_config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_and_client_material() -> (String, String, String) {
        let ca = rcgen::generate_simple_self_signed(vec!["kubernetes".to_string()]).unwrap();
        let client = rcgen::generate_simple_self_signed(vec!["admin".to_string()]).unwrap();
        (
            ca.cert.pem(),
            client.cert.pem(),
            client.signing_key.serialize_pem(),
        )
    }

    fn resolver(insecure: bool) -> KubeconfigResolver {
        // The kube client is never dialed by build_material
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        KubeconfigResolver::new(client, insecure)
    }

    #[tokio::test]
    async fn test_build_material_with_client_certs() {
        let (ca_pem, cert_pem, key_pem) = ca_and_client_material();
        let kubeconfig = Kubeconfig::with_client_cert(
            "c1",
            "https://kubernetes.default.svc",
            ca_pem.as_bytes(),
            cert_pem.as_bytes(),
            key_pem.as_bytes(),
        );

        let material = resolver(false).build_material("c1", &kubeconfig).unwrap();
        // ALPN must be pinned to HTTP/1.1 for upgrade support
        assert_eq!(material.client_config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn test_build_material_requires_ca_when_verifying() {
        let kubeconfig = Kubeconfig::default();
        let err = resolver(false).build_material("c1", &kubeconfig).unwrap_err();
        assert!(err.to_string().contains("certificate-authority-data"));
    }

    #[tokio::test]
    async fn test_build_material_insecure_without_ca() {
        let kubeconfig = Kubeconfig::default();
        assert!(resolver(true).build_material("c1", &kubeconfig).is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_unknown_is_noop() {
        resolver(true).invalidate("missing");
    }
}
