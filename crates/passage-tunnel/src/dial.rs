//! Remote-dial policy and stream serving
//!
//! The agent accepts stream-open requests only for permitted destinations:
//! TCP to any host, and only specific unix/named-pipe endpoints. Everything
//! else is refused with a Close frame carrying the reason.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::stream::TunnelStream;

/// Time allowed for dialing the destination of an accepted stream
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Unix socket the default policy permits
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Named pipe the default policy permits
const DOCKER_PIPE: &str = "//./pipe/docker_engine";

/// Policy applied to inbound stream-open requests
#[derive(Clone)]
pub enum DialPolicy {
    /// Refuse every open request. Used on the gateway side, which only
    /// originates streams.
    Deny,
    /// Accept requests the predicate approves of
    Allow(Arc<dyn Fn(&str, &str) -> bool + Send + Sync>),
}

impl DialPolicy {
    /// The agent's default policy (§ remote-dial authorizer)
    pub fn remote_default() -> Self {
        DialPolicy::Allow(Arc::new(default_remote_dial_policy))
    }

    pub(crate) fn allows(&self, proto: &str, address: &str) -> bool {
        match self {
            DialPolicy::Deny => false,
            DialPolicy::Allow(predicate) => predicate(proto, address),
        }
    }
}

impl std::fmt::Debug for DialPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialPolicy::Deny => write!(f, "DialPolicy::Deny"),
            DialPolicy::Allow(_) => write!(f, "DialPolicy::Allow"),
        }
    }
}

/// Default remote-dial policy: TCP anywhere, the Docker socket/pipe, and
/// nothing else
pub fn default_remote_dial_policy(proto: &str, address: &str) -> bool {
    match proto {
        "tcp" => true,
        "unix" => address == DOCKER_SOCKET,
        "npipe" => address == DOCKER_PIPE,
        _ => false,
    }
}

/// Serve one accepted stream by dialing its destination and copying bytes
/// in both directions until either side closes
pub(crate) async fn serve_dial(mut stream: TunnelStream, proto: String, address: String) {
    let id = stream.id();
    debug!(stream_id = id, %proto, %address, "Serving remote dial");

    match proto.as_str() {
        "tcp" => {
            let conn = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&address)).await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!(stream_id = id, %address, error = %e, "Remote dial failed");
                    stream.close_with_reason(&format!("dial tcp://{address} failed: {e}"));
                    return;
                }
                Err(_) => {
                    warn!(stream_id = id, %address, "Remote dial timed out");
                    stream.close_with_reason(&format!("dial tcp://{address} timed out"));
                    return;
                }
            };
            bridge(stream, conn).await;
        }
        #[cfg(unix)]
        "unix" => {
            let conn = match tokio::time::timeout(
                DIAL_TIMEOUT,
                tokio::net::UnixStream::connect(&address),
            )
            .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!(stream_id = id, %address, error = %e, "Unix dial failed");
                    stream.close_with_reason(&format!("dial unix://{address} failed: {e}"));
                    return;
                }
                Err(_) => {
                    stream.close_with_reason(&format!("dial unix://{address} timed out"));
                    return;
                }
            };
            bridge(stream, conn).await;
        }
        other => {
            stream.close_with_reason(&format!("protocol {other} not supported on this platform"));
        }
    }
}

async fn bridge<C>(mut stream: TunnelStream, mut conn: C)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let id = stream.id();
    match copy_bidirectional(&mut stream, &mut conn).await {
        Ok((from_tunnel, to_tunnel)) => {
            debug!(stream_id = id, from_tunnel, to_tunnel, "Stream ended");
        }
        Err(e) => {
            debug!(stream_id = id, error = %e, "Stream bridge error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_allows_tcp_anywhere() {
        assert!(default_remote_dial_policy("tcp", "kubernetes.default.svc:443"));
        assert!(default_remote_dial_policy("tcp", "127.0.0.1:6443"));
    }

    #[test]
    fn test_default_policy_restricts_unix() {
        assert!(default_remote_dial_policy("unix", "/var/run/docker.sock"));
        assert!(!default_remote_dial_policy("unix", "/etc/passwd"));
        assert!(!default_remote_dial_policy("unix", "/var/run/other.sock"));
    }

    #[test]
    fn test_default_policy_restricts_npipe() {
        assert!(default_remote_dial_policy("npipe", "//./pipe/docker_engine"));
        assert!(!default_remote_dial_policy("npipe", "//./pipe/other"));
    }

    #[test]
    fn test_default_policy_rejects_other_protocols() {
        assert!(!default_remote_dial_policy("udp", "10.0.0.1:53"));
        assert!(!default_remote_dial_policy("", "anywhere"));
    }

    #[test]
    fn test_deny_policy_refuses_everything() {
        let policy = DialPolicy::Deny;
        assert!(!policy.allows("tcp", "127.0.0.1:80"));
    }

    #[test]
    fn test_allow_policy_delegates() {
        let policy = DialPolicy::remote_default();
        assert!(policy.allows("tcp", "127.0.0.1:80"));
        assert!(!policy.allows("udp", "127.0.0.1:80"));
    }
}
