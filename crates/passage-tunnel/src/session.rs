//! Tunnel sessions
//!
//! A [`Session`] owns the demux loop for one authenticated tunnel, a writer
//! pair of channels (control + data), the map of open streams, and the
//! heartbeat. It is transport-agnostic: callers move [`Frame`]s between the
//! [`SessionIo`] channels and the actual wire (a WebSocket in production,
//! another session's channels in tests).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dial::{serve_dial, DialPolicy};
use crate::error::TunnelError;
use crate::frame::Frame;
use crate::stream::{StreamEntry, StreamState, TunnelStream};

/// Buffer sizes for the writer-facing channels
const DATA_CHANNEL_SIZE: usize = 64;
const WIRE_CHANNEL_SIZE: usize = 64;
const INBOUND_CHANNEL_SIZE: usize = 256;

/// Session tuning knobs
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Keep-alive cadence
    pub heartbeat_interval: Duration,
    /// Number of unanswered pings that closes the session
    pub max_missed_heartbeats: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
        }
    }
}

/// The session's end of the wire
pub struct SessionIo {
    /// Frames the caller must write to the wire
    pub outbound: mpsc::Receiver<Frame>,
    /// Frames the caller read from the wire
    pub inbound: mpsc::Sender<Frame>,
}

/// One live, authenticated tunnel between the gateway and an agent
pub struct Session {
    tunnel_id: String,
    created_at: SystemTime,
    shared: Arc<Shared>,
}

struct Shared {
    tunnel_id: String,
    streams: Arc<DashMap<u32, StreamEntry>>,
    control_tx: mpsc::UnboundedSender<Frame>,
    data_tx: mpsc::Sender<Frame>,
    next_stream_id: AtomicU32,
    missed_pings: AtomicU32,
    cancel: CancellationToken,
}

impl Shared {
    fn create_stream(&self, id: u32) -> TunnelStream {
        let state = Arc::new(StreamState::new(id));
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.streams.insert(
            id,
            StreamEntry {
                data_tx,
                state: state.clone(),
            },
        );
        TunnelStream::new(
            state,
            data_rx,
            self.control_tx.clone(),
            self.data_tx.clone(),
            self.streams.clone(),
        )
    }

    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        // Fail every open stream before dropping the entries so readers see
        // an error rather than a clean EOF
        for entry in self.streams.iter() {
            entry.value().state.close(Some("session closed".to_string()));
        }
        self.streams.clear();
        info!(tunnel_id = %self.tunnel_id, "Session closed");
    }
}

impl Session {
    /// Create a session with default configuration
    pub fn new(tunnel_id: impl Into<String>, policy: DialPolicy) -> (Arc<Session>, SessionIo) {
        Self::with_config(tunnel_id, policy, SessionConfig::default())
    }

    /// Create a session with explicit configuration
    pub fn with_config(
        tunnel_id: impl Into<String>,
        policy: DialPolicy,
        config: SessionConfig,
    ) -> (Arc<Session>, SessionIo) {
        let tunnel_id = tunnel_id.into();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_SIZE);
        let (wire_tx, wire_rx) = mpsc::channel(WIRE_CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);

        let shared = Arc::new(Shared {
            tunnel_id: tunnel_id.clone(),
            streams: Arc::new(DashMap::new()),
            control_tx,
            data_tx,
            next_stream_id: AtomicU32::new(1),
            missed_pings: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_writer(
            control_rx,
            data_rx,
            wire_tx,
            shared.cancel.clone(),
        ));
        tokio::spawn(run_demux(inbound_rx, shared.clone(), policy));
        tokio::spawn(run_heartbeat(shared.clone(), config));

        let session = Arc::new(Session {
            tunnel_id,
            created_at: SystemTime::now(),
            shared,
        });

        (
            session,
            SessionIo {
                outbound: wire_rx,
                inbound: inbound_tx,
            },
        )
    }

    /// The tunnel id this session is registered under
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// When the session was established
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolve when the session closes
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Close the session, failing all open streams
    pub fn close(&self) {
        self.shared.close();
    }

    /// Number of currently open streams
    pub fn active_streams(&self) -> usize {
        self.shared.streams.len()
    }

    /// Open a new logical stream to `proto://address` on the peer.
    ///
    /// This is the gateway-side dialer: the returned stream conforms to a
    /// TCP-like connection and is handed to the per-tunnel HTTP client.
    pub fn open_stream(&self, proto: &str, address: &str) -> Result<TunnelStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.shared.create_stream(id);

        self.shared
            .control_tx
            .send(Frame::Open {
                stream_id: id,
                proto: proto.to_string(),
                address: address.to_string(),
            })
            .map_err(|_| TunnelError::SessionClosed)?;

        debug!(tunnel_id = %self.tunnel_id, stream_id = id, %proto, %address, "Opened stream");
        Ok(stream)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tunnel_id", &self.tunnel_id)
            .field("closed", &self.is_closed())
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

/// Merge control and data frames onto the wire channel.
///
/// Control frames (opens, closes, window updates, heartbeats) take priority
/// over data so a backlogged stream cannot starve flow-control traffic.
async fn run_writer(
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    mut data_rx: mpsc::Receiver<Frame>,
    wire_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = control_rx.recv() => frame,
            frame = data_rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if wire_tx.send(frame).await.is_err() {
            break;
        }
    }
}

/// Route inbound frames to their streams
async fn run_demux(mut inbound_rx: mpsc::Receiver<Frame>, shared: Arc<Shared>, policy: DialPolicy) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = inbound_rx.recv() => frame,
        };
        let Some(frame) = frame else {
            // Wire gone
            break;
        };
        handle_frame(&shared, &policy, frame);
    }
    shared.close();
}

fn handle_frame(shared: &Arc<Shared>, policy: &DialPolicy, frame: Frame) {
    match frame {
        Frame::Data { stream_id, payload } => {
            let Some(entry) = shared.streams.get(&stream_id) else {
                debug!(tunnel_id = %shared.tunnel_id, stream_id, "Data for unknown stream");
                return;
            };
            if !entry.state.take_recv(payload.len()) {
                warn!(
                    tunnel_id = %shared.tunnel_id,
                    stream_id,
                    "Peer overran flow-control window, closing stream"
                );
                entry.state.close(Some("flow control violation".to_string()));
                drop(entry);
                shared.streams.remove(&stream_id);
                let _ = shared.control_tx.send(Frame::Close {
                    stream_id,
                    reason: "flow control violation".to_string(),
                });
                return;
            }
            if entry.data_tx.send(payload).is_err() {
                // Reader dropped; the stream's Drop already sent a Close
                drop(entry);
                shared.streams.remove(&stream_id);
            }
        }
        Frame::Open {
            stream_id,
            proto,
            address,
        } => {
            if !policy.allows(&proto, &address) {
                warn!(
                    tunnel_id = %shared.tunnel_id,
                    stream_id,
                    %proto,
                    %address,
                    "Refusing remote dial"
                );
                let _ = shared.control_tx.send(Frame::Close {
                    stream_id,
                    reason: format!("dial refused: {proto}://{address}"),
                });
                return;
            }
            let stream = shared.create_stream(stream_id);
            tokio::spawn(serve_dial(stream, proto, address));
        }
        Frame::WindowUpdate { stream_id, credit } => {
            if let Some(entry) = shared.streams.get(&stream_id) {
                entry.state.add_send_credit(credit);
            }
        }
        Frame::Close { stream_id, reason } => {
            if let Some((_, entry)) = shared.streams.remove(&stream_id) {
                let reason = if reason.is_empty() { None } else { Some(reason) };
                entry.state.close(reason);
                // Dropping the entry's sender delivers EOF to the reader
            }
        }
        Frame::Ping => {
            // A ping proves the peer is alive too
            shared.missed_pings.store(0, Ordering::Release);
            let _ = shared.control_tx.send(Frame::Pong);
        }
        Frame::Pong => {
            shared.missed_pings.store(0, Ordering::Release);
        }
    }
}

/// Send keep-alive pings; close the session after too many missed beats
async fn run_heartbeat(shared: Arc<Shared>, config: SessionConfig) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    // Consume the immediate first tick
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let missed = shared.missed_pings.fetch_add(1, Ordering::AcqRel);
        if missed >= config.max_missed_heartbeats {
            warn!(
                tunnel_id = %shared.tunnel_id,
                missed,
                "Heartbeat timeout, closing session"
            );
            shared.close();
            return;
        }
        if shared.control_tx.send(Frame::Ping).is_err() {
            shared.close();
            return;
        }
    }
}
