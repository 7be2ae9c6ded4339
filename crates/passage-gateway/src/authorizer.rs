//! Agent connection authorizer
//!
//! Validates an agent's `/connect` handshake and yields the authoritative
//! tunnel id. Two modes, selected at gateway startup: shared-secret token or
//! JWT. Failure causes are logged but never leaked to the agent.

use std::str::FromStr;
use std::sync::Arc;

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use passage_common::{TokenStore, TUNNEL_ID_HEADER, TUNNEL_TOKEN_HEADER};

use crate::jwt::JwtVerifier;

/// Authentication mode for tunnel connections
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TunnelAuthMode {
    /// Shared-secret token from the token store
    #[default]
    Token,
    /// Bearer JWT validated against the configured issuer
    Jwt,
}

impl FromStr for TunnelAuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(TunnelAuthMode::Token),
            "jwt" => Ok(TunnelAuthMode::Jwt),
            other => Err(format!("unknown tunnel auth mode: {other}")),
        }
    }
}

/// Errors rejecting an agent handshake. Logged, not returned to the agent.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The X-Tunnel-Id header is missing or empty
    #[error("empty tunnel id header")]
    MissingTunnelId,

    /// No credential header for the configured mode
    #[error("missing credentials for tunnel {0}")]
    MissingCredentials(String),

    /// The presented token does not match the stored one
    #[error("invalid token for tunnel {0}")]
    InvalidToken(String),

    /// Token store lookup failed
    #[error("token lookup failed for tunnel {tunnel_id}: {message}")]
    TokenLookup {
        /// The asserted tunnel id
        tunnel_id: String,
        /// The underlying failure
        message: String,
    },

    /// JWT validation failed
    #[error("jwt rejected for tunnel {tunnel_id}: {message}")]
    Jwt {
        /// The asserted tunnel id
        tunnel_id: String,
        /// The underlying failure
        message: String,
    },
}

/// Result of a successful handshake authorization
#[derive(Debug)]
pub struct AuthOutcome {
    /// The authoritative tunnel id the session must be registered under
    pub tunnel_id: String,
}

/// Authorizes agent `/connect` handshakes
pub struct AgentAuthorizer {
    mode: TunnelAuthMode,
    token_store: Arc<dyn TokenStore>,
    jwt: Option<Arc<dyn JwtVerifier>>,
}

impl AgentAuthorizer {
    /// Create a token-mode authorizer
    pub fn token_mode(token_store: Arc<dyn TokenStore>) -> Self {
        Self {
            mode: TunnelAuthMode::Token,
            token_store,
            jwt: None,
        }
    }

    /// Create a jwt-mode authorizer
    pub fn jwt_mode(token_store: Arc<dyn TokenStore>, jwt: Arc<dyn JwtVerifier>) -> Self {
        Self {
            mode: TunnelAuthMode::Jwt,
            token_store,
            jwt: Some(jwt),
        }
    }

    /// The configured mode
    pub fn mode(&self) -> TunnelAuthMode {
        self.mode
    }

    /// Validate a handshake request's headers.
    ///
    /// An empty tunnel id is rejected before any credential check, so a
    /// valid token or JWT never authenticates an unidentified agent.
    pub async fn authorize(&self, headers: &HeaderMap) -> Result<AuthOutcome, AuthError> {
        let tunnel_id = headers
            .get(TUNNEL_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingTunnelId)?
            .to_string();

        match self.mode {
            TunnelAuthMode::Token => {
                let presented = headers
                    .get(TUNNEL_TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| AuthError::MissingCredentials(tunnel_id.clone()))?;

                let stored = self
                    .token_store
                    .get_token(&tunnel_id)
                    .await
                    .map_err(|e| AuthError::TokenLookup {
                        tunnel_id: tunnel_id.clone(),
                        message: e.to_string(),
                    })?;

                // Constant-time comparison: equal length is required first
                // since ct_eq only compares equal-length slices
                let stored = stored.value.as_bytes();
                let presented = presented.as_bytes();
                let matches =
                    stored.len() == presented.len() && bool::from(stored.ct_eq(presented));

                if matches {
                    debug!(tunnel_id = %tunnel_id, "Agent token accepted");
                    Ok(AuthOutcome { tunnel_id })
                } else {
                    warn!(tunnel_id = %tunnel_id, "Agent token mismatch");
                    Err(AuthError::InvalidToken(tunnel_id))
                }
            }
            TunnelAuthMode::Jwt => {
                let verifier = self.jwt.as_ref().ok_or_else(|| AuthError::Jwt {
                    tunnel_id: tunnel_id.clone(),
                    message: "no JWT verifier configured".to_string(),
                })?;

                let token = bearer_token(headers)
                    .ok_or_else(|| AuthError::MissingCredentials(tunnel_id.clone()))?;

                verifier
                    .verify(token)
                    .await
                    .map_err(|e| AuthError::Jwt {
                        tunnel_id: tunnel_id.clone(),
                        message: e.to_string(),
                    })?;

                debug!(tunnel_id = %tunnel_id, "Agent JWT accepted");
                Ok(AuthOutcome { tunnel_id })
            }
        }
    }
}

/// Extract a bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use passage_common::crd::ClusterConnect;
    use passage_common::{Error, Token};

    /// In-memory token store for handshake tests
    #[derive(Default)]
    struct MemoryTokenStore {
        tokens: DashMap<String, String>,
    }

    #[async_trait]
    impl TokenStore for MemoryTokenStore {
        async fn token_exists(&self, tunnel_id: &str) -> passage_common::Result<bool> {
            Ok(self.tokens.contains_key(tunnel_id))
        }

        async fn get_token(&self, tunnel_id: &str) -> passage_common::Result<Token> {
            self.tokens
                .get(tunnel_id)
                .map(|v| Token { value: v.clone() })
                .ok_or_else(|| Error::token_store(tunnel_id, "not found"))
        }

        async fn create_and_store_token(
            &self,
            tunnel_id: &str,
            _owner: &ClusterConnect,
        ) -> passage_common::Result<()> {
            self.tokens
                .entry(tunnel_id.to_string())
                .or_insert_with(|| passage_common::generate_token(54));
            Ok(())
        }

        async fn delete_token(&self, tunnel_id: &str) -> passage_common::Result<()> {
            self.tokens.remove(tunnel_id);
            Ok(())
        }
    }

    fn store_with_token(tunnel_id: &str, token: &str) -> Arc<MemoryTokenStore> {
        let store = MemoryTokenStore::default();
        store.tokens.insert(tunnel_id.to_string(), token.to_string());
        Arc::new(store)
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn test_token_mode_accepts_matching_token() {
        let authorizer = AgentAuthorizer::token_mode(store_with_token("c1", "secret-token"));
        let outcome = authorizer
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "c1"),
                (TUNNEL_TOKEN_HEADER, "secret-token"),
            ]))
            .await
            .unwrap();
        assert_eq!(outcome.tunnel_id, "c1");
    }

    #[tokio::test]
    async fn test_token_mode_rejects_wrong_token() {
        let authorizer = AgentAuthorizer::token_mode(store_with_token("c1", "secret-token"));
        let result = authorizer
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "c1"),
                (TUNNEL_TOKEN_HEADER, "wrong"),
            ]))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_empty_tunnel_id_rejected_with_valid_token() {
        // Property 10: an empty X-Tunnel-Id is rejected regardless of
        // credential validity
        let authorizer = AgentAuthorizer::token_mode(store_with_token("c1", "secret-token"));
        let result = authorizer
            .authorize(&headers(&[(TUNNEL_TOKEN_HEADER, "secret-token")]))
            .await;
        assert!(matches!(result, Err(AuthError::MissingTunnelId)));

        let result = authorizer
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, ""),
                (TUNNEL_TOKEN_HEADER, "secret-token"),
            ]))
            .await;
        assert!(matches!(result, Err(AuthError::MissingTunnelId)));
    }

    #[tokio::test]
    async fn test_token_mode_requires_token_header() {
        let authorizer = AgentAuthorizer::token_mode(store_with_token("c1", "secret-token"));
        let result = authorizer
            .authorize(&headers(&[(TUNNEL_ID_HEADER, "c1")]))
            .await;
        assert!(matches!(result, Err(AuthError::MissingCredentials(_))));
    }

    #[tokio::test]
    async fn test_unknown_tunnel_reports_lookup_failure() {
        let authorizer = AgentAuthorizer::token_mode(Arc::new(MemoryTokenStore::default()));
        let result = authorizer
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "ghost"),
                (TUNNEL_TOKEN_HEADER, "anything"),
            ]))
            .await;
        assert!(matches!(result, Err(AuthError::TokenLookup { .. })));
    }

    struct AcceptAll;

    #[async_trait]
    impl JwtVerifier for AcceptAll {
        async fn verify(&self, _token: &str) -> Result<crate::jwt::Claims, crate::jwt::JwtError> {
            Ok(crate::jwt::Claims::new())
        }
    }

    struct RejectAll;

    #[async_trait]
    impl JwtVerifier for RejectAll {
        async fn verify(&self, _token: &str) -> Result<crate::jwt::Claims, crate::jwt::JwtError> {
            Err(crate::jwt::JwtError::Rejected("bad signature".to_string()))
        }
    }

    #[tokio::test]
    async fn test_jwt_mode_accepts_valid_bearer() {
        let authorizer =
            AgentAuthorizer::jwt_mode(Arc::new(MemoryTokenStore::default()), Arc::new(AcceptAll));
        let outcome = authorizer
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "c1"),
                ("authorization", "Bearer some.jwt.token"),
            ]))
            .await
            .unwrap();
        assert_eq!(outcome.tunnel_id, "c1");
    }

    #[tokio::test]
    async fn test_jwt_mode_rejects_invalid_bearer() {
        let authorizer =
            AgentAuthorizer::jwt_mode(Arc::new(MemoryTokenStore::default()), Arc::new(RejectAll));
        let result = authorizer
            .authorize(&headers(&[
                (TUNNEL_ID_HEADER, "c1"),
                ("authorization", "Bearer some.jwt.token"),
            ]))
            .await;
        assert!(matches!(result, Err(AuthError::Jwt { .. })));
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer abc")])),
            Some("abc")
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_auth_mode_from_str() {
        assert_eq!("token".parse::<TunnelAuthMode>(), Ok(TunnelAuthMode::Token));
        assert_eq!("jwt".parse::<TunnelAuthMode>(), Ok(TunnelAuthMode::Jwt));
        assert!("oauth".parse::<TunnelAuthMode>().is_err());
    }
}
