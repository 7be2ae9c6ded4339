//! Gateway HTTP server
//!
//! One port, three route groups: `/healthz` and `/metrics` (no auth),
//! `/connect` (agent authorizer), and `/kubernetes/{tunnelID}/...` (JWT +
//! policy on the external host, open internally).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use passage_common::SecretTokenStore;
use passage_tunnel::{DialPolicy, Frame, Session};

use crate::authorizer::{AgentAuthorizer, TunnelAuthMode};
use crate::jwt::{JwtVerifier, OidcVerifier};
use crate::kubeconfig::KubeconfigResolver;
use crate::metrics::{self, CONNECTION_COUNTER};
use crate::middleware::external_surface;
use crate::opa::{OpaClient, OpaConfig};
use crate::probe::ConnectionProbe;
use crate::proxy::{kubeapi_handler, ClientCache};
use crate::registry::{SessionRegistry, SharedSessionRegistry};

/// Default client-cache eviction cadence
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);

/// Gateway runtime configuration, assembled from CLI flags
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Address and port to listen on
    pub listen_addr: SocketAddr,
    /// Enforce JWT + policy on the external surface
    pub enable_auth: bool,
    /// Count tunnel connections in metrics
    pub enable_metrics: bool,
    /// Host the external surface answers on; None disables host scoping
    pub external_host: Option<String>,
    /// Agent handshake authentication mode
    pub tunnel_auth_mode: TunnelAuthMode,
    /// OIDC issuer for JWT validation
    pub oidc_issuer_url: Option<String>,
    /// Disable JWT signature validation (development only)
    pub oidc_insecure_skip_verify: bool,
    /// Skip verification of the remote API server certificate
    pub tls_insecure_skip_verify: bool,
    /// OPA endpoint for the external policy check
    pub opa: Option<OpaConfig>,
    /// Client-cache eviction cadence
    pub client_cleanup_interval: Duration,
    /// Connection probe cadence
    pub probe_interval: Duration,
}

/// Shared state for all gateway handlers
#[derive(Clone)]
pub struct AppState {
    /// Session registry
    pub registry: SharedSessionRegistry,
    /// Per-tunnel HTTP client cache
    pub clients: Arc<ClientCache>,
    /// Kubeconfig TLS material resolver
    pub kubeconfigs: Arc<KubeconfigResolver>,
    /// Agent handshake authorizer
    pub authorizer: Arc<AgentAuthorizer>,
    /// JWT verifier for the external surface
    pub verifier: Option<Arc<dyn JwtVerifier>>,
    /// Policy engine client
    pub opa: Option<Arc<OpaClient>>,
    /// External host for surface scoping
    pub external_host: Option<String>,
    /// Whether external auth is enforced
    pub enable_auth: bool,
    /// Whether connection metrics are recorded
    pub enable_metrics: bool,
}

/// Build the gateway router
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new().route("/healthz", get(healthz));
    if state.enable_metrics {
        router = router.route("/metrics", get(metrics_handler));
    }
    router
        .route("/connect", get(connect_handler))
        .route(
            "/kubernetes/{tunnel_id}/{*rest}",
            any(kubeapi_handler).layer(axum::middleware::from_fn_with_state::<
                _,
                _,
                (State<AppState>, axum::extract::Request),
            >(state.clone(), external_surface)),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "Ok\n"
}

async fn metrics_handler() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
        .into_response()
}

/// Agent tunnel handshake: authorize, upgrade, and install the session
async fn connect_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let outcome = match state.authorizer.authorize(&headers).await {
        Ok(outcome) => {
            if state.enable_metrics {
                CONNECTION_COUNTER.with_label_values(&["succeeded"]).inc();
            }
            outcome
        }
        Err(e) => {
            // The cause is logged, not echoed to the agent
            warn!(error = %e, "Rejected agent connection");
            if state.enable_metrics {
                CONNECTION_COUNTER.with_label_values(&["rejected"]).inc();
            }
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let registry = state.registry.clone();
    let kubeconfigs = state.kubeconfigs.clone();
    ws.on_upgrade(move |socket| serve_tunnel(socket, outcome.tunnel_id, registry, kubeconfigs))
}

/// Pump frames between the WebSocket and the session until either side ends
async fn serve_tunnel(
    socket: WebSocket,
    tunnel_id: String,
    registry: SharedSessionRegistry,
    kubeconfigs: Arc<KubeconfigResolver>,
) {
    info!(tunnel_id = %tunnel_id, "Agent connected");

    let (session, io) = Session::new(&tunnel_id, DialPolicy::Deny);
    let passage_tunnel::SessionIo {
        outbound: mut session_out,
        inbound: session_in,
    } = io;

    // A reconnecting agent may carry rotated credentials
    kubeconfigs.invalidate(&tunnel_id);
    registry.register(session.clone());

    let (mut ws_sink, mut ws_stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = session_out.recv().await {
            if ws_sink.send(Message::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match Frame::decode(&data) {
                Ok(frame) => {
                    if session_in.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(tunnel_id = %tunnel_id, error = %e, "Malformed frame from agent");
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(tunnel_id = %tunnel_id, "Agent sent close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(tunnel_id = %tunnel_id, error = %e, "Tunnel socket error");
                break;
            }
        }
    }

    session.close();
    registry.remove(&tunnel_id, &session);
    writer.abort();
    info!(tunnel_id = %tunnel_id, "Agent disconnected");
}

/// Run the gateway until the process is terminated
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let kube_client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let token_store = Arc::new(SecretTokenStore::new(
        kube_client.clone(),
        passage_common::secret_namespace(),
    ));

    let verifier: Option<Arc<dyn JwtVerifier>> = config.oidc_issuer_url.as_ref().map(|url| {
        Arc::new(OidcVerifier::new(url, config.oidc_insecure_skip_verify)) as Arc<dyn JwtVerifier>
    });

    let authorizer = Arc::new(match config.tunnel_auth_mode {
        TunnelAuthMode::Token => AgentAuthorizer::token_mode(token_store),
        TunnelAuthMode::Jwt => AgentAuthorizer::jwt_mode(
            token_store,
            verifier
                .clone()
                .context("tunnel-auth-mode jwt requires --oidc-issuer-url")?,
        ),
    });

    let registry: SharedSessionRegistry = Arc::new(SessionRegistry::new());
    let kubeconfigs = Arc::new(KubeconfigResolver::new(
        kube_client.clone(),
        config.tls_insecure_skip_verify,
    ));
    let clients = Arc::new(ClientCache::new(registry.clone(), kubeconfigs.clone()));
    let opa = config.opa.clone().map(|c| Arc::new(OpaClient::new(c)));

    let state = AppState {
        registry: registry.clone(),
        clients: clients.clone(),
        kubeconfigs,
        authorizer,
        verifier,
        opa,
        external_host: config.external_host.clone(),
        enable_auth: config.enable_auth,
        enable_metrics: config.enable_metrics,
    };

    // Evict per-tunnel clients whose session is gone
    {
        let clients = clients.clone();
        let interval = config.client_cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Sweeping client cache");
                clients.evict_stale();
            }
        });
    }

    // Correlate registry state with ClusterConnect probe status
    tokio::spawn(
        ConnectionProbe::new(kube_client, registry, config.probe_interval).run(),
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Gateway listening");

    axum::serve(listener, app)
        .await
        .context("gateway server failed")?;
    Ok(())
}
