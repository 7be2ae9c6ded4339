//! Open Policy Agent client
//!
//! The external `/kubernetes` surface asks OPA whether a validated caller may
//! reach a given project. The policy body itself is opaque to the gateway.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// OPA connection settings
#[derive(Clone, Debug)]
pub struct OpaConfig {
    /// Base address including scheme, e.g. `http://localhost`
    pub address: String,
    /// Port of the OPA REST API
    pub port: u16,
}

/// Errors talking to OPA
#[derive(Debug, Error)]
pub enum OpaError {
    /// Request failed at the transport level
    #[error("opa request failed: {0}")]
    Request(String),

    /// OPA returned something other than a boolean result
    #[error("malformed opa response: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct OpaResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// Client for the OPA data API
pub struct OpaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OpaClient {
    /// Create a client for the configured OPA endpoint
    pub fn new(config: OpaConfig) -> Self {
        Self {
            base_url: format!("{}:{}", config.address.trim_end_matches('/'), config.port),
            http: reqwest::Client::new(),
        }
    }

    /// Evaluate `data.<package>.<rule>` with the given input document.
    ///
    /// Returns the boolean decision; a missing or non-boolean result is an
    /// error rather than an implicit allow.
    pub async fn check(
        &self,
        package: &str,
        rule: &str,
        input: serde_json::Value,
    ) -> Result<bool, OpaError> {
        let url = format!("{}/v1/data/{}/{}", self.base_url, package, rule);
        debug!(url = %url, "Evaluating OPA policy");

        let response: OpaResponse = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(|e| OpaError::Request(e.to_string()))?
            .json()
            .await
            .map_err(|e| OpaError::Malformed(e.to_string()))?;

        match response.result {
            Some(serde_json::Value::Bool(allowed)) => Ok(allowed),
            other => Err(OpaError::Malformed(format!(
                "expected boolean result, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_formatting() {
        let client = OpaClient::new(OpaConfig {
            address: "http://localhost/".to_string(),
            port: 8181,
        });
        assert_eq!(client.base_url, "http://localhost:8181");
    }

    #[test]
    fn test_response_parsing() {
        let allowed: OpaResponse = serde_json::from_str(r#"{"result": true}"#).unwrap();
        assert_eq!(allowed.result, Some(serde_json::Value::Bool(true)));

        let empty: OpaResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.result.is_none());
    }
}
