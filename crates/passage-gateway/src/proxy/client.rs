//! Per-tunnel HTTP clients
//!
//! Each cached client is a hyper client whose connector opens a tunnel
//! stream to the remote API server and wraps it in client TLS built from the
//! tunnel's kubeconfig. Clients are cached by `(tunnelID, timeout)`; misses
//! synchronize on a per-key cell so concurrent misses fetch the kubeconfig
//! once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::sync::OnceCell;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use passage_common::KUBE_API_AUTHORITY;
use passage_tunnel::TunnelStream;

use crate::kubeconfig::KubeconfigResolver;
use crate::registry::SharedSessionRegistry;

use super::ProxyError;

/// Cache key for per-tunnel clients
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// Tunnel the client dials through
    pub tunnel_id: String,
    /// Request timeout bucket, in seconds
    pub timeout_secs: u64,
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tunnel_id, self.timeout_secs)
    }
}

/// A cached per-tunnel HTTP client
#[derive(Debug)]
pub struct ProxyClient {
    /// The hyper client, pooled over tunnel connections
    pub client: Client<TunnelConnector, Body>,
    /// Per-request timeout from the cache key
    pub timeout: Duration,
}

/// Cache of per-tunnel HTTP clients
pub struct ClientCache {
    clients: DashMap<ClientKey, Arc<OnceCell<Arc<ProxyClient>>>>,
    registry: SharedSessionRegistry,
    kubeconfigs: Arc<KubeconfigResolver>,
}

impl ClientCache {
    /// Create an empty cache
    pub fn new(registry: SharedSessionRegistry, kubeconfigs: Arc<KubeconfigResolver>) -> Self {
        Self {
            clients: DashMap::new(),
            registry,
            kubeconfigs,
        }
    }

    /// Get or lazily construct the client for `(tunnelID, timeout)`.
    ///
    /// Misses synchronize on a per-key cell: concurrent requests for the
    /// same key perform a single kubeconfig fetch.
    pub async fn get_or_create(
        &self,
        tunnel_id: &str,
        timeout: Duration,
    ) -> Result<Arc<ProxyClient>, ProxyError> {
        let key = ClientKey {
            tunnel_id: tunnel_id.to_string(),
            timeout_secs: timeout.as_secs(),
        };

        let cell = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| async {
            // The session must exist before we pay for a kubeconfig fetch
            if !self.registry.has_session(tunnel_id) {
                return Err(ProxyError::NoSession(tunnel_id.to_string()));
            }

            let material = self
                .kubeconfigs
                .resolve(tunnel_id)
                .await
                .map_err(|e| ProxyError::Kubeconfig(e.to_string()))?;

            let connector = TunnelConnector::new(
                self.registry.clone(),
                tunnel_id,
                material.client_config.clone(),
                KUBE_API_AUTHORITY,
            );

            let client = Client::builder(TokioExecutor::new()).build(connector);
            debug!(key = %key, "Built per-tunnel HTTP client");
            Ok(Arc::new(ProxyClient { client, timeout }))
        })
        .await
        .cloned()
    }

    /// Whether a client is cached for the key (for tests and introspection)
    pub fn contains(&self, tunnel_id: &str, timeout: Duration) -> bool {
        let key = ClientKey {
            tunnel_id: tunnel_id.to_string(),
            timeout_secs: timeout.as_secs(),
        };
        self.clients
            .get(&key)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every cache entry whose tunnel has no live session, along with
    /// its cached kubeconfig. Run by the periodic eviction sweeper.
    pub fn evict_stale(&self) {
        let mut evicted = Vec::new();
        self.clients.retain(|key, _| {
            let live = self.registry.has_session(&key.tunnel_id);
            if !live {
                evicted.push(key.clone());
            }
            live
        });
        for key in evicted {
            self.kubeconfigs.invalidate(&key.tunnel_id);
            info!(key = %key, "Evicted client without live session");
        }
    }
}

/// Connector that dials the remote API server through the tunnel
#[derive(Clone)]
pub struct TunnelConnector {
    registry: SharedSessionRegistry,
    tunnel_id: String,
    tls: Arc<ClientConfig>,
    authority: String,
}

impl TunnelConnector {
    /// Create a connector dialing `authority` through the tunnel's session
    pub fn new(
        registry: SharedSessionRegistry,
        tunnel_id: impl Into<String>,
        tls: Arc<ClientConfig>,
        authority: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            tunnel_id: tunnel_id.into(),
            tls,
            authority: authority.into(),
        }
    }
}

impl tower::Service<http::Uri> for TunnelConnector {
    type Response = TunnelConnection;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: http::Uri) -> Self::Future {
        let registry = self.registry.clone();
        let tunnel_id = self.tunnel_id.clone();
        let tls = self.tls.clone();
        let authority = self.authority.clone();

        Box::pin(async move {
            let session = registry
                .lookup(&tunnel_id)
                .ok_or_else(|| format!("no session for tunnel {tunnel_id}"))?;

            let stream = session.open_stream("tcp", &authority)?;

            let server_name = ServerName::try_from("kubernetes.default.svc")
                .map_err(|e| format!("invalid server name: {e}"))?;
            let tls_stream = TlsConnector::from(tls)
                .connect(server_name, stream)
                .await
                .map_err(|e| format!("TLS handshake through tunnel failed: {e}"))?;

            Ok(TunnelConnection {
                inner: TokioIo::new(tls_stream),
            })
        })
    }
}

/// One TLS-wrapped tunnel stream serving as a hyper connection
pub struct TunnelConnection {
    inner: TokioIo<TlsStream<TunnelStream>>,
}

impl Connection for TunnelConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for TunnelConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.inner), cx, buf)
    }
}

impl hyper::rt::Write for TunnelConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.inner), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.inner), cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use passage_tunnel::{DialPolicy, Session};

    fn test_cache() -> (ClientCache, SharedSessionRegistry) {
        let registry = Arc::new(SessionRegistry::new());
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let kubeconfigs = Arc::new(KubeconfigResolver::new(client, true));
        (ClientCache::new(registry.clone(), kubeconfigs), registry)
    }

    #[test]
    fn test_client_key_display() {
        let key = ClientKey {
            tunnel_id: "c1".to_string(),
            timeout_secs: 15,
        };
        assert_eq!(key.to_string(), "c1/15");
    }

    #[tokio::test]
    async fn test_get_or_create_without_session_is_500_class_error() {
        // Property 8: missing session is a registry-lookup failure, not 404
        let (cache, _registry) = test_cache();
        let err = cache
            .get_or_create("ghost", Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoSession(_)));
    }

    #[tokio::test]
    async fn test_evict_stale_removes_dead_tunnels() {
        // Property 3: entries whose tunnel has no session are removed by
        // the sweep
        let (cache, registry) = test_cache();

        let (session, _io) = Session::new("c1", DialPolicy::Deny);
        registry.register(session.clone());

        // Seed an uninitialized cache entry for a live and a dead tunnel
        cache
            .clients
            .insert(
                ClientKey {
                    tunnel_id: "c1".to_string(),
                    timeout_secs: 15,
                },
                Arc::new(OnceCell::new()),
            );
        cache
            .clients
            .insert(
                ClientKey {
                    tunnel_id: "dead".to_string(),
                    timeout_secs: 15,
                },
                Arc::new(OnceCell::new()),
            );
        assert_eq!(cache.len(), 2);

        cache.evict_stale();

        assert_eq!(cache.len(), 1);
        assert!(cache
            .clients
            .iter()
            .all(|entry| entry.key().tunnel_id == "c1"));

        // Once the session goes away the remaining entry is swept too
        registry.remove("c1", &session);
        cache.evict_stale();
        assert!(cache.is_empty());
    }
}
