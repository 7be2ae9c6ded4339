//! Multiplexed tunnel transport between agent and gateway
//!
//! One persistent connection per remote cluster carries many independent
//! logical streams, each corresponding to one proxied request. The transport
//! is transport-agnostic: a [`Session`] speaks [`Frame`]s over a pair of
//! in-memory channels, and the WebSocket adaptation lives with the caller
//! (axum on the gateway, tungstenite on the agent). This keeps the whole
//! multiplexer testable in-process by crossing two sessions' channels.
//!
//! # Flow control
//!
//! Credit-based, per stream, 256 KiB initial window in each direction. A
//! writer parks when its send window is exhausted; the reader replenishes
//! with `WindowUpdate` frames after consuming half a window. Control frames
//! travel on a dedicated channel so a stalled stream never blocks another
//! stream or the heartbeat.
//!
//! # Heartbeat
//!
//! Both ends ping every 30 seconds. Three consecutive unanswered pings close
//! the session.

mod dial;
mod error;
mod frame;
mod session;
mod stream;

pub use dial::{default_remote_dial_policy, DialPolicy};
pub use error::{FrameError, TunnelError};
pub use frame::{Frame, INITIAL_WINDOW, MAX_DATA_FRAME};
pub use session::{Session, SessionConfig, SessionIo};
pub use stream::TunnelStream;
