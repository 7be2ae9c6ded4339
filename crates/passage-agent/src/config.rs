//! Agent configuration

use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// Authentication mode toward the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AgentAuthMode {
    /// Shared-secret token in the X-API-Tunnel-Token header
    #[default]
    Token,
    /// Bearer JWT read from the token path
    Jwt,
}

impl FromStr for AgentAuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(AgentAuthMode::Token),
            "jwt" => Ok(AgentAuthMode::Jwt),
            other => Err(format!("unknown tunnel auth mode: {other}")),
        }
    }
}

/// Errors validating the agent configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required value missing
    #[error("{0} is required")]
    Missing(&'static str),

    /// Gateway URL could not be parsed
    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),

    /// Gateway URL scheme is not usable for a tunnel
    #[error("gateway URL has unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Validated agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Gateway WebSocket URL (normalized to ws/wss)
    pub gateway_url: Url,
    /// Tunnel id asserted on the handshake
    pub tunnel_id: String,
    /// Skip verification of the gateway certificate
    pub insecure_skip_verify: bool,
    /// Handshake authentication mode
    pub auth_mode: AgentAuthMode,
    /// Shared-secret token (token mode)
    pub auth_token: Option<String>,
    /// Path to the JWT file (jwt mode)
    pub token_path: String,
    /// Path of the static-pod manifest this agent was launched from
    pub static_pod_path: String,
}

impl AgentConfig {
    /// Validate raw flag values, normalizing `http`/`https` schemes to
    /// `ws`/`wss`
    pub fn new(
        gateway_url: &str,
        tunnel_id: &str,
        insecure_skip_verify: bool,
        auth_mode: AgentAuthMode,
        auth_token: Option<String>,
        token_path: String,
        static_pod_path: String,
    ) -> Result<Self, ConfigError> {
        if gateway_url.is_empty() {
            return Err(ConfigError::Missing("gateway-url"));
        }
        if tunnel_id.is_empty() {
            return Err(ConfigError::Missing("tunnel-id"));
        }

        let mut url =
            Url::parse(gateway_url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => url
                .set_scheme("ws")
                .map_err(|_| ConfigError::InvalidUrl(gateway_url.to_string()))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|_| ConfigError::InvalidUrl(gateway_url.to_string()))?,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        Ok(Self {
            gateway_url: url,
            tunnel_id: tunnel_id.to_string(),
            insecure_skip_verify,
            auth_mode,
            auth_token,
            token_path,
            static_pod_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(url: &str, tunnel: &str) -> Result<AgentConfig, ConfigError> {
        AgentConfig::new(
            url,
            tunnel,
            true,
            AgentAuthMode::Token,
            Some("secret".to_string()),
            "./access_token".to_string(),
            "/var/lib/kubelet/static-pods/connect-agent.yaml".to_string(),
        )
    }

    #[test]
    fn test_requires_gateway_url_and_tunnel_id() {
        assert!(matches!(make("", "c1"), Err(ConfigError::Missing("gateway-url"))));
        assert!(matches!(
            make("wss://gw.example.com/connect", ""),
            Err(ConfigError::Missing("tunnel-id"))
        ));
    }

    #[test]
    fn test_http_schemes_normalized_to_ws() {
        let config = make("http://gw.example.com/connect", "c1").unwrap();
        assert_eq!(config.gateway_url.scheme(), "ws");

        let config = make("https://gw.example.com/connect", "c1").unwrap();
        assert_eq!(config.gateway_url.scheme(), "wss");
    }

    #[test]
    fn test_ws_schemes_pass_through() {
        let config = make("wss://gw.example.com/connect", "c1").unwrap();
        assert_eq!(config.gateway_url.as_str(), "wss://gw.example.com/connect");
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(matches!(
            make("ftp://gw.example.com", "c1"),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_auth_mode_parsing() {
        assert_eq!("token".parse(), Ok(AgentAuthMode::Token));
        assert_eq!("jwt".parse(), Ok(AgentAuthMode::Jwt));
        assert!("basic".parse::<AgentAuthMode>().is_err());
    }
}
