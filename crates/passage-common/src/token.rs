//! Per-tunnel shared-secret tokens
//!
//! Tokens authenticate the connect agent's tunnel handshake. One token per
//! tunnel, stored in a Kubernetes Secret named `<tunnelID>-agent-token` and
//! owned by the ClusterConnect so that cascade deletion removes orphans.
//!
//! Tokens are deliberately not cached in-process: they are small, fetched off
//! the hot path, and freshness matters more than latency.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::crd::ClusterConnect;
use crate::{Error, Result, MAX_TUNNEL_ID_LEN, TOKEN_SECRET_SUFFIX};

/// Number of random bytes in a generated token (108 hex characters)
pub const DEFAULT_TOKEN_LENGTH: usize = 54;

/// Key of the token value inside the Secret data
pub const TOKEN_DATA_KEY: &str = "token";

/// An agent authentication token
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    /// The hex-encoded token value
    pub value: String,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the token value in debug output
        f.debug_struct("Token").field("len", &self.value.len()).finish()
    }
}

/// Generate a random token of `size` bytes, rendered as lowercase hex
pub fn generate_token(size: usize) -> String {
    let mut raw = vec![0u8; size];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Derive the token Secret name for a tunnel id.
///
/// Rejects ids that would push the Secret name past the 253-character
/// resource-name limit of the backing store.
pub fn token_secret_name(tunnel_id: &str) -> Result<String> {
    if tunnel_id.is_empty() {
        return Err(Error::validation("tunnel id must not be empty"));
    }
    if tunnel_id.len() > MAX_TUNNEL_ID_LEN {
        return Err(Error::validation_for(
            tunnel_id,
            format!(
                "tunnel id exceeds {} characters; derived Secret name would not fit the resource-name limit",
                MAX_TUNNEL_ID_LEN
            ),
        ));
    }
    Ok(format!("{tunnel_id}{TOKEN_SECRET_SUFFIX}"))
}

/// Store of per-tunnel agent tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Check whether a token exists for the tunnel id
    async fn token_exists(&self, tunnel_id: &str) -> Result<bool>;

    /// Retrieve the token for the tunnel id
    async fn get_token(&self, tunnel_id: &str) -> Result<Token>;

    /// Create and persist a token for the tunnel id, owned by the given
    /// ClusterConnect. Idempotent: an existing token is left untouched.
    async fn create_and_store_token(&self, tunnel_id: &str, owner: &ClusterConnect) -> Result<()>;

    /// Delete the token for the tunnel id
    async fn delete_token(&self, tunnel_id: &str) -> Result<()>;
}

/// Token store backed by Kubernetes Secrets in a single namespace
pub struct SecretTokenStore {
    secrets: Api<Secret>,
    namespace: String,
}

impl SecretTokenStore {
    /// Create a store using the given client and Secret namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            secrets: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    /// The namespace this store writes Secrets into
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl TokenStore for SecretTokenStore {
    async fn token_exists(&self, tunnel_id: &str) -> Result<bool> {
        let name = token_secret_name(tunnel_id)?;
        match self.secrets.get(&name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_token(&self, tunnel_id: &str) -> Result<Token> {
        let name = token_secret_name(tunnel_id)?;
        let secret = self.secrets.get(&name).await.map_err(|e| {
            Error::token_store(tunnel_id, format!("failed to get token secret: {e}"))
        })?;

        let value = secret
            .data
            .as_ref()
            .and_then(|d| d.get(TOKEN_DATA_KEY))
            .map(|b| String::from_utf8_lossy(&b.0).to_string())
            .ok_or_else(|| {
                Error::token_store(tunnel_id, format!("secret {name} has no token field"))
            })?;

        Ok(Token { value })
    }

    async fn create_and_store_token(&self, tunnel_id: &str, owner: &ClusterConnect) -> Result<()> {
        let name = token_secret_name(tunnel_id)?;
        let token = generate_token(DEFAULT_TOKEN_LENGTH);

        let mut data = BTreeMap::new();
        data.insert(TOKEN_DATA_KEY.to_string(), ByteString(token.into_bytes()));

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        match self.secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!(tunnel_id = %tunnel_id, secret = %name, "Created agent token");
                Ok(())
            }
            // Idempotent on conflict: a concurrent reconcile already created it
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(tunnel_id = %tunnel_id, secret = %name, "Token already exists");
                Ok(())
            }
            Err(e) => Err(Error::token_store(
                tunnel_id,
                format!("failed to create token secret: {e}"),
            )),
        }
    }

    async fn delete_token(&self, tunnel_id: &str) -> Result<()> {
        let name = token_secret_name(tunnel_id)?;
        match self.secrets.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(tunnel_id = %tunnel_id, secret = %name, "Deleted agent token");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::token_store(
                tunnel_id,
                format!("failed to delete token secret: {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_is_hex_of_expected_length() {
        let token = generate_token(DEFAULT_TOKEN_LENGTH);
        assert_eq!(token.len(), DEFAULT_TOKEN_LENGTH * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_token_is_random() {
        let a = generate_token(DEFAULT_TOKEN_LENGTH);
        let b = generate_token(DEFAULT_TOKEN_LENGTH);
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_secret_name() {
        assert_eq!(token_secret_name("c1").unwrap(), "c1-agent-token");
    }

    #[test]
    fn test_token_secret_name_rejects_empty() {
        assert!(token_secret_name("").is_err());
    }

    #[test]
    fn test_token_secret_name_rejects_overlong_id() {
        let id = "x".repeat(MAX_TUNNEL_ID_LEN + 1);
        let err = token_secret_name(&id).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_token_secret_name_accepts_max_length() {
        let id = "x".repeat(MAX_TUNNEL_ID_LEN);
        let name = token_secret_name(&id).unwrap();
        assert!(name.len() <= 253);
    }

    #[test]
    fn test_token_debug_does_not_leak_value() {
        let token = Token {
            value: "super-secret".to_string(),
        };
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("super-secret"));
    }
}
