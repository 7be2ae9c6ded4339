//! Tunnel error types

use thiserror::Error;

/// Errors produced by the tunnel transport
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The session is closed (transport gone or cancelled)
    #[error("session closed")]
    SessionClosed,

    /// The stream was closed by the peer
    #[error("stream closed: {reason}")]
    StreamClosed {
        /// Reason carried by the Close frame, empty on clean close
        reason: String,
    },

    /// The agent refused a stream-open request
    #[error("remote dial refused: {proto}://{address}")]
    DialRefused {
        /// Requested protocol
        proto: String,
        /// Requested destination
        address: String,
    },

    /// The peer violated the flow-control window
    #[error("flow control violation on stream {stream_id}")]
    WindowViolation {
        /// Stream on which the violation occurred
        stream_id: u32,
    },

    /// Malformed frame on the wire
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Errors decoding a frame from the wire
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than its declared layout
    #[error("truncated frame")]
    Truncated,

    /// Unknown frame kind byte
    #[error("unknown frame kind: {0:#x}")]
    UnknownKind(u8),

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 in frame")]
    InvalidUtf8,

    /// Data payload exceeds the maximum frame size
    #[error("data frame exceeds maximum size")]
    Oversized,
}
