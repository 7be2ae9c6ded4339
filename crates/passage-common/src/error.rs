//! Error types for Passage
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries contextual information such as tunnel ids and the failing
//! subsystem.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Passage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for ClusterConnect specs
    #[error("validation error for {tunnel_id}: {message}")]
    Validation {
        /// Tunnel id of the object with invalid configuration
        tunnel_id: String,
        /// Description of what's invalid
        message: String,
    },

    /// Token store error
    #[error("token store error for {tunnel_id}: {message}")]
    TokenStore {
        /// Tunnel id the token belongs to
        tunnel_id: String,
        /// Description of what failed
        message: String,
    },

    /// Agent manifest rendering error
    #[error("manifest error: {message}")]
    Manifest {
        /// Description of what failed
        message: String,
    },

    /// Kubeconfig generation or parsing error
    #[error("kubeconfig error for {tunnel_id}: {message}")]
    Kubeconfig {
        /// Tunnel id the kubeconfig belongs to
        tunnel_id: String,
        /// Description of what failed
        message: String,
    },

    /// Startup configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's missing or malformed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error without tunnel context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            tunnel_id: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with tunnel context
    pub fn validation_for(tunnel_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            tunnel_id: tunnel_id.into(),
            message: msg.into(),
        }
    }

    /// Create a token store error with tunnel context
    pub fn token_store(tunnel_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TokenStore {
            tunnel_id: tunnel_id.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest rendering error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
        }
    }

    /// Create a kubeconfig error with tunnel context
    pub fn kubeconfig(tunnel_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            tunnel_id: tunnel_id.into(),
            message: msg.into(),
        }
    }

    /// Create a startup configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and configuration errors are not retryable (they require a
    /// spec or environment fix). Store and internal errors are transient.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry transient K8s errors, never 4xx client errors
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::TokenStore { .. } => true,
            Error::Manifest { .. } => false,
            Error::Kubeconfig { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the tunnel id if this error is associated with one
    pub fn tunnel_id(&self) -> Option<&str> {
        match self {
            Error::Validation { tunnel_id, .. }
            | Error::TokenStore { tunnel_id, .. }
            | Error::Kubeconfig { tunnel_id, .. } => Some(tunnel_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: admission rejects over-long tunnel ids with a clear message
    #[test]
    fn story_validation_rejects_overlong_tunnel_id() {
        let err = Error::validation_for("c1", "tunnel id exceeds 240 characters");
        assert!(err.to_string().contains("c1"));
        assert!(err.to_string().contains("240"));
        assert!(!err.is_retryable());
        assert_eq!(err.tunnel_id(), Some("c1"));
    }

    /// Story: store outages surface as retryable errors so the reconciler
    /// requeues instead of marking the object failed
    #[test]
    fn story_store_outage_is_retryable() {
        let err = Error::token_store("edge-7", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.tunnel_id(), Some("edge-7"));
    }

    #[test]
    fn test_config_error_not_retryable() {
        let err = Error::config("AGENT_IMAGE is not set");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("AGENT_IMAGE"));
        assert_eq!(err.tunnel_id(), None);
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("watcher", "stream ended");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[watcher]"));

        let err = Error::internal("stream ended");
        assert!(err.to_string().contains(&format!("[{}]", UNKNOWN_CONTEXT)));
    }

    #[test]
    fn test_manifest_error_not_retryable() {
        assert!(!Error::manifest("undefined variable").is_retryable());
    }
}
