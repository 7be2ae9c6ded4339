//! Tunnel client
//!
//! Dials the gateway over an outbound WebSocket (so standard
//! outbound-HTTPS-only firewalls pass it), authenticates with the configured
//! mode, and serves tunnel streams with the remote-dial policy.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use passage_common::{tls, TUNNEL_ID_HEADER, TUNNEL_TOKEN_HEADER};
use passage_tunnel::{DialPolicy, Frame, Session, SessionIo};

use crate::config::{AgentAuthMode, AgentConfig};

/// Time allowed for the WebSocket handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Time allowed for the TCP dial
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors terminating the agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// Gateway URL has no usable host/port
    #[error("invalid gateway address: {0}")]
    Address(String),

    /// DNS resolution or TCP dial failed
    #[error("failed to dial gateway: {0}")]
    Dial(String),

    /// WebSocket handshake failed or timed out
    #[error("tunnel handshake failed: {0}")]
    Handshake(String),

    /// The JWT file could not be read
    #[error("failed to read token file {path}: {message}")]
    TokenRead {
        /// Configured token path
        path: String,
        /// Underlying failure
        message: String,
    },

    /// Required credential missing for the configured mode
    #[error("auth-token is required in token mode")]
    MissingToken,

    /// The tunnel transport failed
    #[error("tunnel transport error: {0}")]
    Transport(String),
}

/// Run the agent until the tunnel ends.
///
/// Any return is terminal: the static-pod supervisor restarts the process.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let request = build_request(&config).await?;
    let stream = dial(&config).await?;

    let connector = if config.insecure_skip_verify {
        warn!("TLS verification to the gateway is disabled");
        Connector::Rustls(std::sync::Arc::new(tls::insecure_client_config()))
    } else {
        Connector::Rustls(std::sync::Arc::new(tls::client_config_system_roots()))
    };

    let (socket, _response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        client_async_tls_with_config(request, stream, None, Some(connector)),
    )
    .await
    .map_err(|_| AgentError::Handshake("handshake timed out".to_string()))?
    .map_err(|e| AgentError::Handshake(e.to_string()))?;

    info!(gateway = %config.gateway_url, tunnel_id = %config.tunnel_id, "Connected to gateway");

    serve(socket, &config.tunnel_id).await
}

/// Resolve the gateway host explicitly and dial it
async fn dial(config: &AgentConfig) -> Result<TcpStream, AgentError> {
    let host = config
        .gateway_url
        .host_str()
        .ok_or_else(|| AgentError::Address("gateway URL has no host".to_string()))?;
    let port = config
        .gateway_url
        .port_or_known_default()
        .ok_or_else(|| AgentError::Address("gateway URL has no port".to_string()))?;

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AgentError::Dial(format!("resolving {host}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| AgentError::Dial(format!("{host} resolved to no addresses")))?;

    debug!(%addr, "Dialing gateway");
    tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| AgentError::Dial(format!("{addr}: connect timed out")))?
        .map_err(|e| AgentError::Dial(format!("{addr}: {e}")))
}

/// Build the handshake request with the tunnel id and credentials
async fn build_request(
    config: &AgentConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, AgentError> {
    let mut request = config
        .gateway_url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::Handshake(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        TUNNEL_ID_HEADER,
        config
            .tunnel_id
            .parse()
            .map_err(|_| AgentError::Address("tunnel id is not a valid header value".to_string()))?,
    );

    match config.auth_mode {
        AgentAuthMode::Token => {
            info!("Token auth to gateway enabled");
            let token = config.auth_token.as_deref().ok_or(AgentError::MissingToken)?;
            headers.insert(
                TUNNEL_TOKEN_HEADER,
                token
                    .parse()
                    .map_err(|_| AgentError::Handshake("invalid token value".to_string()))?,
            );
        }
        AgentAuthMode::Jwt => {
            info!("Jwt auth to gateway enabled");
            let token = tokio::fs::read_to_string(&config.token_path)
                .await
                .map_err(|e| AgentError::TokenRead {
                    path: config.token_path.clone(),
                    message: e.to_string(),
                })?;
            let bearer = format!("Bearer {}", token.trim());
            headers.insert(
                http::header::AUTHORIZATION,
                bearer
                    .parse()
                    .map_err(|_| AgentError::Handshake("invalid JWT value".to_string()))?,
            );
        }
    }

    Ok(request)
}

/// Serve the tunnel: pump frames between the WebSocket and the session
async fn serve(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tunnel_id: &str,
) -> Result<(), AgentError> {
    let (session, io) = Session::new(tunnel_id, DialPolicy::remote_default());
    let SessionIo {
        outbound: mut session_out,
        inbound: session_in,
    } = io;

    let (mut ws_sink, mut ws_stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = session_out.recv().await {
            if ws_sink.send(Message::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut result = Ok(());
    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match Frame::decode(&data) {
                Ok(frame) => {
                    if session_in.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    result = Err(AgentError::Transport(format!("malformed frame: {e}")));
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                info!("Gateway closed the tunnel");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                result = Err(AgentError::Transport(e.to_string()));
                break;
            }
        }
    }

    session.close();
    writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(auth_mode: AgentAuthMode, auth_token: Option<&str>, token_path: &str) -> AgentConfig {
        AgentConfig::new(
            "wss://gateway.example.com/connect",
            "c1",
            true,
            auth_mode,
            auth_token.map(|t| t.to_string()),
            token_path.to_string(),
            "/var/lib/kubelet/static-pods/connect-agent.yaml".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_request_token_mode() {
        let config = config(AgentAuthMode::Token, Some("secret-token"), "./unused");
        let request = build_request(&config).await.unwrap();

        assert_eq!(request.headers().get(TUNNEL_ID_HEADER).unwrap(), "c1");
        assert_eq!(
            request.headers().get(TUNNEL_TOKEN_HEADER).unwrap(),
            "secret-token"
        );
        assert!(request.headers().get(http::header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_build_request_token_mode_requires_token() {
        let config = config(AgentAuthMode::Token, None, "./unused");
        assert!(matches!(
            build_request(&config).await,
            Err(AgentError::MissingToken)
        ));
    }

    #[tokio::test]
    async fn test_build_request_jwt_mode_reads_and_trims_file() {
        let path = std::env::temp_dir().join("passage-agent-test-jwt");
        tokio::fs::write(&path, "  my.jwt.token\n").await.unwrap();

        let config = config(AgentAuthMode::Jwt, None, path.to_str().unwrap());
        let request = build_request(&config).await.unwrap();

        assert_eq!(
            request.headers().get(http::header::AUTHORIZATION).unwrap(),
            "Bearer my.jwt.token"
        );

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_build_request_jwt_mode_missing_file() {
        let config = config(AgentAuthMode::Jwt, None, "/nonexistent/token");
        assert!(matches!(
            build_request(&config).await,
            Err(AgentError::TokenRead { .. })
        ));
    }
}
