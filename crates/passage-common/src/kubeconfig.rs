//! Minimal kubeconfig model
//!
//! Just enough of the kubeconfig format to generate admin configs in the
//! controller and to extract TLS material in the gateway. Field names follow
//! the kubeconfig wire format (kebab-case for the credential data fields).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A kubeconfig document
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Kubeconfig {
    /// Always "v1"
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always "Config"
    pub kind: String,
    /// Cluster entries
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// User credential entries
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Context entries
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Active context name
    #[serde(rename = "current-context", default)]
    pub current_context: String,
}

/// A named cluster entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// The cluster coordinates
    pub cluster: Cluster,
}

/// Cluster coordinates and trust anchors
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Cluster {
    /// API server URL
    pub server: String,
    /// Base64-encoded PEM CA bundle
    #[serde(
        rename = "certificate-authority-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority_data: Option<String>,
    /// Skip server verification
    #[serde(
        rename = "insecure-skip-tls-verify",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub insecure_skip_tls_verify: Option<bool>,
}

/// A named user entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// The credentials
    pub user: User,
}

/// User credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct User {
    /// Base64-encoded PEM client certificate
    #[serde(
        rename = "client-certificate-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_data: Option<String>,
    /// Base64-encoded PEM client key
    #[serde(
        rename = "client-key-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_key_data: Option<String>,
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A named context entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// The context
    pub context: KubeContext,
}

/// A cluster/user pairing
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KubeContext {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

impl Kubeconfig {
    /// Build an admin kubeconfig with client-certificate credentials.
    ///
    /// PEM inputs are base64-encoded into the document; `server` is used
    /// verbatim.
    pub fn with_client_cert(
        cluster_name: &str,
        server: &str,
        server_ca_pem: &[u8],
        client_cert_pem: &[u8],
        client_key_pem: &[u8],
    ) -> Self {
        let user_name = format!("{cluster_name}-admin");
        let context_name = format!("{user_name}@{cluster_name}");
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: Cluster {
                    server: server.to_string(),
                    certificate_authority_data: Some(BASE64.encode(server_ca_pem)),
                    insecure_skip_tls_verify: None,
                },
            }],
            users: vec![NamedUser {
                name: user_name.clone(),
                user: User {
                    client_certificate_data: Some(BASE64.encode(client_cert_pem)),
                    client_key_data: Some(BASE64.encode(client_key_pem)),
                    token: None,
                },
            }],
            contexts: vec![NamedContext {
                name: context_name.clone(),
                context: KubeContext {
                    cluster: cluster_name.to_string(),
                    user: user_name,
                },
            }],
            current_context: context_name,
        }
    }

    /// Parse a kubeconfig from YAML bytes
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(data)
            .map_err(|e| Error::internal(format!("failed to parse kubeconfig: {e}")))
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::internal(format!("failed to serialize kubeconfig: {e}")))
    }

    /// Decode the first cluster's CA bundle, if present
    pub fn server_ca_pem(&self) -> Result<Option<Vec<u8>>> {
        let Some(data) = self
            .clusters
            .first()
            .and_then(|c| c.cluster.certificate_authority_data.as_deref())
        else {
            return Ok(None);
        };
        BASE64
            .decode(data)
            .map(Some)
            .map_err(|e| Error::internal(format!("invalid CA data in kubeconfig: {e}")))
    }

    /// Decode the first user's client certificate and key, if present
    pub fn client_cert_pem(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(user) = self.users.first().map(|u| &u.user) else {
            return Ok(None);
        };
        let (Some(cert), Some(key)) = (
            user.client_certificate_data.as_deref(),
            user.client_key_data.as_deref(),
        ) else {
            return Ok(None);
        };
        let cert = BASE64
            .decode(cert)
            .map_err(|e| Error::internal(format!("invalid client cert data: {e}")))?;
        let key = BASE64
            .decode(key)
            .map_err(|e| Error::internal(format!("invalid client key data: {e}")))?;
        Ok(Some((cert, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_client_cert_roundtrip() {
        let config = Kubeconfig::with_client_cert(
            "c1",
            "http://gateway.internal:8080/kubernetes/c1",
            b"ca-pem",
            b"cert-pem",
            b"key-pem",
        );

        let yaml = config.to_yaml().unwrap();
        let parsed = Kubeconfig::from_yaml(yaml.as_bytes()).unwrap();
        assert_eq!(parsed, config);

        assert_eq!(parsed.current_context, "c1-admin@c1");
        assert_eq!(
            parsed.clusters[0].cluster.server,
            "http://gateway.internal:8080/kubernetes/c1"
        );
        assert_eq!(parsed.server_ca_pem().unwrap().unwrap(), b"ca-pem");
        let (cert, key) = parsed.client_cert_pem().unwrap().unwrap();
        assert_eq!(cert, b"cert-pem");
        assert_eq!(key, b"key-pem");
    }

    #[test]
    fn test_kebab_case_field_names() {
        let config = Kubeconfig::with_client_cert("c1", "https://s", b"ca", b"crt", b"key");
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("certificate-authority-data"));
        assert!(yaml.contains("client-certificate-data"));
        assert!(yaml.contains("client-key-data"));
        assert!(yaml.contains("current-context"));
    }

    #[test]
    fn test_missing_credentials_are_none() {
        let yaml = r#"
apiVersion: v1
kind: Config
clusters:
- name: c1
  cluster:
    server: https://example.com
"#;
        let config = Kubeconfig::from_yaml(yaml.as_bytes()).unwrap();
        assert!(config.server_ca_pem().unwrap().is_none());
        assert!(config.client_cert_pem().unwrap().is_none());
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        assert!(Kubeconfig::from_yaml(b"{not yaml: [").is_err());
    }
}
