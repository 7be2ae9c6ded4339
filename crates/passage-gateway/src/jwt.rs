//! JWT validation
//!
//! Validates bearer tokens against an OIDC issuer. Used by the external
//! `/kubernetes` surface and by the agent authorizer in jwt mode. Signing
//! keys are discovered through the issuer's JWKS endpoint and cached with a
//! refresh cooldown so a flood of unknown-kid tokens cannot hammer the
//! issuer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Claims extracted from a validated token
pub type Claims = serde_json::Map<String, serde_json::Value>;

/// Errors validating a bearer token
#[derive(Debug, Error)]
pub enum JwtError {
    /// Token could not be parsed
    #[error("malformed token: {0}")]
    Malformed(String),

    /// No signing key matches the token's kid
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature or claim validation failed
    #[error("token rejected: {0}")]
    Rejected(String),

    /// Issuer discovery or JWKS fetch failed
    #[error("jwks fetch failed: {0}")]
    Discovery(String),
}

/// Validates bearer tokens and yields their claims
#[async_trait]
pub trait JwtVerifier: Send + Sync {
    /// Validate the token, returning its claims on success
    async fn verify(&self, token: &str) -> Result<Claims, JwtError>;
}

/// Minimum interval between JWKS refreshes
const JWKS_REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// OIDC discovery document (the fields we need)
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

/// Individual JWK entry; only RSA keys are supported
#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    last_refresh: Option<Instant>,
}

/// Verifier backed by an OIDC issuer's JWKS
pub struct OidcVerifier {
    issuer_url: String,
    insecure_skip_verify: bool,
    http: reqwest::Client,
    jwks: RwLock<JwksCache>,
}

impl OidcVerifier {
    /// Create a verifier for the given issuer.
    ///
    /// With `insecure_skip_verify`, signature validation is disabled and only
    /// the claims (expiry) are checked. For development environments only.
    pub fn new(issuer_url: impl Into<String>, insecure_skip_verify: bool) -> Self {
        Self {
            issuer_url: issuer_url.into().trim_end_matches('/').to_string(),
            insecure_skip_verify,
            http: reqwest::Client::new(),
            jwks: RwLock::new(JwksCache {
                keys: HashMap::new(),
                last_refresh: None,
            }),
        }
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, JwtError> {
        {
            let cache = self.jwks.read().await;
            if let Some(key) = cache.keys.get(kid) {
                return Ok(key.clone());
            }
        }
        self.refresh_jwks().await?;
        let cache = self.jwks.read().await;
        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| JwtError::UnknownKey(kid.to_string()))
    }

    async fn refresh_jwks(&self) -> Result<(), JwtError> {
        let mut cache = self.jwks.write().await;
        if let Some(last) = cache.last_refresh {
            if last.elapsed() < JWKS_REFRESH_COOLDOWN {
                return Ok(());
            }
        }

        let discovery_url = format!("{}/.well-known/openid-configuration", self.issuer_url);
        debug!(url = %discovery_url, "Fetching OIDC discovery document");
        let discovery: OidcDiscovery = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| JwtError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| JwtError::Discovery(e.to_string()))?;

        let jwks: JwksDocument = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| JwtError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| JwtError::Discovery(e.to_string()))?;

        let mut keys = HashMap::new();
        for key in jwks.keys {
            let (Some(kid), Some(n), Some(e)) = (key.kid, key.n.as_deref(), key.e.as_deref())
            else {
                continue;
            };
            if key.kty != "RSA" {
                warn!(kid = %kid, kty = %key.kty, "Skipping non-RSA JWKS key");
                continue;
            }
            match DecodingKey::from_rsa_components(n, e) {
                Ok(decoding_key) => {
                    keys.insert(kid, decoding_key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "Invalid RSA key in JWKS"),
            }
        }

        debug!(count = keys.len(), "Refreshed JWKS");
        cache.keys = keys;
        cache.last_refresh = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl JwtVerifier for OidcVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, JwtError> {
        let header = decode_header(token).map_err(|e| JwtError::Malformed(e.to_string()))?;

        let token_data = if self.insecure_skip_verify {
            let mut validation = Validation::new(header.alg);
            validation.insecure_disable_signature_validation();
            validation.validate_aud = false;
            decode::<serde_json::Value>(token, &DecodingKey::from_secret(&[]), &validation)
                .map_err(|e| JwtError::Rejected(e.to_string()))?
        } else {
            let kid = header
                .kid
                .ok_or_else(|| JwtError::Malformed("token has no kid".to_string()))?;
            let key = self.key_for(&kid).await?;
            let mut validation = Validation::new(header.alg);
            validation.set_issuer(&[&self.issuer_url]);
            validation.validate_aud = false;
            decode::<serde_json::Value>(token, &key, &validation)
                .map_err(|e| JwtError::Rejected(e.to_string()))?
        };

        token_data
            .claims
            .as_object()
            .cloned()
            .ok_or_else(|| JwtError::Malformed("claims are not an object".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    fn make_token(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn test_insecure_mode_accepts_valid_claims() {
        let verifier = OidcVerifier::new("https://issuer.example.com", true);
        let token = make_token(json!({"sub": "user-1", "exp": future_exp()}));

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims["sub"], "user-1");
    }

    #[tokio::test]
    async fn test_insecure_mode_rejects_expired_token() {
        let verifier = OidcVerifier::new("https://issuer.example.com", true);
        let token = make_token(json!({"sub": "user-1", "exp": 1000}));

        assert!(matches!(
            verifier.verify(&token).await,
            Err(JwtError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let verifier = OidcVerifier::new("https://issuer.example.com", true);
        assert!(matches!(
            verifier.verify("not-a-jwt").await,
            Err(JwtError::Malformed(_))
        ));
    }

    #[test]
    fn test_issuer_url_trailing_slash_normalized() {
        let verifier = OidcVerifier::new("https://issuer.example.com/", false);
        assert_eq!(verifier.issuer_url, "https://issuer.example.com");
    }
}
