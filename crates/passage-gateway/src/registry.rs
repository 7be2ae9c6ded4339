//! Session registry
//!
//! Process-wide map of `tunnelID -> active session`. The data path reads it
//! on every proxied request; writes only happen on agent connect/disconnect.

use std::sync::Arc;

use dashmap::DashMap;
use passage_tunnel::Session;
use tokio::sync::broadcast;
use tracing::info;

/// Registry events consumed by metrics and the liveness probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was registered for the tunnel id
    Registered {
        /// The tunnel id
        tunnel_id: String,
    },
    /// The session for the tunnel id was removed
    Removed {
        /// The tunnel id
        tunnel_id: String,
    },
}

/// Registry of live agent sessions
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Registry handle shared across tasks
pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    /// Register a session, atomically superseding any prior session for the
    /// same tunnel id.
    ///
    /// The displaced session is closed while the shard lock is held, before
    /// the new value becomes observable, so the new session's first read
    /// cannot interleave with the old session's writer.
    pub fn register(&self, session: Arc<Session>) {
        let tunnel_id = session.tunnel_id().to_string();
        match self.sessions.entry(tunnel_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                occupied.get().close();
                info!(tunnel_id = %tunnel_id, "Superseding existing session");
                occupied.insert(session);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }
        info!(tunnel_id = %tunnel_id, "Session registered");
        let _ = self.events.send(SessionEvent::Registered { tunnel_id });
    }

    /// Look up the live session for a tunnel id
    pub fn lookup(&self, tunnel_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(tunnel_id).map(|s| s.clone())
    }

    /// Remove a session on clean transport close.
    ///
    /// Identity-checked: a disconnecting session that has already been
    /// superseded must not evict its successor.
    pub fn remove(&self, tunnel_id: &str, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(tunnel_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            info!(tunnel_id = %tunnel_id, "Session removed");
            let _ = self.events.send(SessionEvent::Removed {
                tunnel_id: tunnel_id.to_string(),
            });
        }
        removed
    }

    /// Whether a session exists for the tunnel id
    pub fn has_session(&self, tunnel_id: &str) -> bool {
        self.sessions.contains_key(tunnel_id)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All registered tunnel ids
    pub fn tunnel_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
