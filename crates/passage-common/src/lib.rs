//! Common types for Passage: the ClusterConnect CRD, errors, token store,
//! TLS helpers, and telemetry initialization.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kubeconfig;
pub mod telemetry;
pub mod tls;
pub mod token;

pub use error::Error;
pub use token::{generate_token, token_secret_name, SecretTokenStore, Token, TokenStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Header carrying the tunnel id on the agent handshake
pub const TUNNEL_ID_HEADER: &str = "X-Tunnel-Id";

/// Header carrying the shared-secret token on the agent handshake
pub const TUNNEL_TOKEN_HEADER: &str = "X-API-Tunnel-Token";

/// Path the agent dials for the tunnel handshake
pub const CONNECT_PATH: &str = "/connect";

/// The in-cluster API server endpoint that proxied requests are rewritten to
pub const KUBE_API_ENDPOINT: &str = "https://kubernetes.default.svc";

/// Host:port dialed through the tunnel for proxied API requests
pub const KUBE_API_AUTHORITY: &str = "kubernetes.default.svc:443";

/// Default namespace for per-tunnel token Secrets
pub const DEFAULT_SECRET_NAMESPACE: &str = "connect-gateway-secrets";

/// Environment variable overriding the token Secret namespace
pub const SECRET_NAMESPACE_ENV: &str = "SECRET_NAMESPACE";

/// Key of the kubeconfig payload inside the kubeconfig Secret
pub const KUBECONFIG_DATA_KEY: &str = "value";

/// Key of the orchestration-cluster CA inside the kubeconfig Secret
pub const API_SERVER_CA_KEY: &str = "apiServerCA";

/// Label recording the kubeconfig Secret name on a ClusterConnect
pub const KUBECONFIG_NAME_LABEL: &str = "cluster.x-k8s.io/kubeconfig-name";

/// Label recording the kubeconfig Secret namespace on a ClusterConnect
pub const KUBECONFIG_NAMESPACE_LABEL: &str = "cluster.x-k8s.io/kubeconfig-namespace";

/// Default gateway listen port
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;

/// Tunnel ids above this length would push derived Secret names past the
/// 253-character resource-name limit, so they are rejected at admission.
pub const MAX_TUNNEL_ID_LEN: usize = 240;

/// Suffix appended to the tunnel id to form the token Secret name
pub const TOKEN_SECRET_SUFFIX: &str = "-agent-token";

/// Resolve the token Secret namespace from the environment
pub fn secret_namespace() -> String {
    std::env::var(SECRET_NAMESPACE_ENV)
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_SECRET_NAMESPACE.to_string())
}

/// Install the process-wide rustls crypto provider.
///
/// Must be called before creating any TLS connection, including kube clients.
/// Safe to call multiple times.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_namespace_default() {
        // Unset in the test environment
        std::env::remove_var(SECRET_NAMESPACE_ENV);
        assert_eq!(secret_namespace(), DEFAULT_SECRET_NAMESPACE);
    }

    #[test]
    fn test_max_tunnel_id_fits_resource_name_limit() {
        assert!(MAX_TUNNEL_ID_LEN + TOKEN_SECRET_SUFFIX.len() <= 253);
    }
}
