//! Binary frame codec
//!
//! Frames are carried as WebSocket binary messages. Layout:
//!
//! ```text
//! | kind: u8 | stream_id: u32 BE | payload ... |
//! ```
//!
//! Payloads by kind:
//! - `Open`:         `| proto_len: u8 | proto | addr_len: u16 BE | addr |`
//! - `Data`:         raw bytes, at most [`MAX_DATA_FRAME`]
//! - `WindowUpdate`: `| credit: u32 BE |`
//! - `Close`:        UTF-8 reason, empty on clean close
//! - `Ping`/`Pong`:  empty, stream id 0

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Maximum payload size of a single data frame
pub const MAX_DATA_FRAME: usize = 32 * 1024;

/// Initial per-stream flow-control window, in bytes, each direction
pub const INITIAL_WINDOW: u32 = 256 * 1024;

const KIND_OPEN: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const KIND_WINDOW_UPDATE: u8 = 0x03;
const KIND_CLOSE: u8 = 0x04;
const KIND_PING: u8 = 0x05;
const KIND_PONG: u8 = 0x06;

const HEADER_LEN: usize = 5;

/// A single tunnel frame
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Request to open a stream to `proto://address`
    Open {
        /// Stream id allocated by the opener
        stream_id: u32,
        /// Destination protocol ("tcp", "unix", "npipe")
        proto: String,
        /// Destination address
        address: String,
    },
    /// Payload bytes on an open stream
    Data {
        /// Stream the payload belongs to
        stream_id: u32,
        /// The payload
        payload: Bytes,
    },
    /// Flow-control credit grant
    WindowUpdate {
        /// Stream the credit applies to
        stream_id: u32,
        /// Bytes the peer may now send
        credit: u32,
    },
    /// Stream close, clean when `reason` is empty
    Close {
        /// Stream being closed
        stream_id: u32,
        /// Failure description, empty on clean close
        reason: String,
    },
    /// Keep-alive probe
    Ping,
    /// Keep-alive response
    Pong,
}

impl Frame {
    /// The stream id this frame applies to (0 for session-level frames)
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Close { stream_id, .. } => *stream_id,
            Frame::Ping | Frame::Pong => 0,
        }
    }

    /// Encode the frame for the wire
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 16);
        match self {
            Frame::Open {
                stream_id,
                proto,
                address,
            } => {
                buf.put_u8(KIND_OPEN);
                buf.put_u32(*stream_id);
                buf.put_u8(proto.len() as u8);
                buf.put_slice(proto.as_bytes());
                buf.put_u16(address.len() as u16);
                buf.put_slice(address.as_bytes());
            }
            Frame::Data { stream_id, payload } => {
                buf.reserve(payload.len());
                buf.put_u8(KIND_DATA);
                buf.put_u32(*stream_id);
                buf.put_slice(payload);
            }
            Frame::WindowUpdate { stream_id, credit } => {
                buf.put_u8(KIND_WINDOW_UPDATE);
                buf.put_u32(*stream_id);
                buf.put_u32(*credit);
            }
            Frame::Close { stream_id, reason } => {
                buf.put_u8(KIND_CLOSE);
                buf.put_u32(*stream_id);
                buf.put_slice(reason.as_bytes());
            }
            Frame::Ping => {
                buf.put_u8(KIND_PING);
                buf.put_u32(0);
            }
            Frame::Pong => {
                buf.put_u8(KIND_PONG);
                buf.put_u32(0);
            }
        }
        buf.freeze()
    }

    /// Decode a frame from wire bytes
    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let kind = data[0];
        let stream_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let payload = &data[HEADER_LEN..];

        match kind {
            KIND_OPEN => {
                if payload.is_empty() {
                    return Err(FrameError::Truncated);
                }
                let proto_len = payload[0] as usize;
                if payload.len() < 1 + proto_len + 2 {
                    return Err(FrameError::Truncated);
                }
                let proto = std::str::from_utf8(&payload[1..1 + proto_len])
                    .map_err(|_| FrameError::InvalidUtf8)?
                    .to_string();
                let addr_len = u16::from_be_bytes([payload[1 + proto_len], payload[2 + proto_len]])
                    as usize;
                let addr_start = 3 + proto_len;
                if payload.len() < addr_start + addr_len {
                    return Err(FrameError::Truncated);
                }
                let address = std::str::from_utf8(&payload[addr_start..addr_start + addr_len])
                    .map_err(|_| FrameError::InvalidUtf8)?
                    .to_string();
                Ok(Frame::Open {
                    stream_id,
                    proto,
                    address,
                })
            }
            KIND_DATA => {
                if payload.len() > MAX_DATA_FRAME {
                    return Err(FrameError::Oversized);
                }
                Ok(Frame::Data {
                    stream_id,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            KIND_WINDOW_UPDATE => {
                if payload.len() < 4 {
                    return Err(FrameError::Truncated);
                }
                let credit = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::WindowUpdate { stream_id, credit })
            }
            KIND_CLOSE => {
                let reason = std::str::from_utf8(payload)
                    .map_err(|_| FrameError::InvalidUtf8)?
                    .to_string();
                Ok(Frame::Close { stream_id, reason })
            }
            KIND_PING => Ok(Frame::Ping),
            KIND_PONG => Ok(Frame::Pong),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        Frame::decode(&frame.encode()).expect("decode should succeed")
    }

    #[test]
    fn test_open_roundtrip() {
        let frame = Frame::Open {
            stream_id: 7,
            proto: "tcp".to_string(),
            address: "kubernetes.default.svc:443".to_string(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_data_roundtrip() {
        let frame = Frame::Data {
            stream_id: 42,
            payload: Bytes::from_static(b"GET /api/v1/namespaces HTTP/1.1\r\n"),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_window_update_roundtrip() {
        let frame = Frame::WindowUpdate {
            stream_id: 3,
            credit: INITIAL_WINDOW / 2,
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_close_roundtrip_with_reason() {
        let frame = Frame::Close {
            stream_id: 9,
            reason: "dial refused".to_string(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_close_roundtrip_clean() {
        let frame = Frame::Close {
            stream_id: 9,
            reason: String::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(roundtrip(Frame::Ping), Frame::Ping);
        assert_eq!(roundtrip(Frame::Pong), Frame::Pong);
        assert_eq!(Frame::Ping.stream_id(), 0);
    }

    #[test]
    fn test_decode_truncated_header() {
        assert_eq!(Frame::decode(&[0x01, 0, 0]), Err(FrameError::Truncated));
        assert_eq!(Frame::decode(&[]), Err(FrameError::Truncated));
    }

    #[test]
    fn test_decode_truncated_open() {
        // Open frame declaring a longer proto than present
        let mut data = vec![0x01, 0, 0, 0, 1];
        data.push(200);
        data.extend_from_slice(b"tcp");
        assert_eq!(Frame::decode(&data), Err(FrameError::Truncated));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let data = [0x7f, 0, 0, 0, 1];
        assert_eq!(Frame::decode(&data), Err(FrameError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_decode_oversized_data() {
        let mut data = vec![0x02, 0, 0, 0, 1];
        data.extend(std::iter::repeat(0u8).take(MAX_DATA_FRAME + 1));
        assert_eq!(Frame::decode(&data), Err(FrameError::Oversized));
    }

    #[test]
    fn test_decode_invalid_utf8_close() {
        let data = [0x04, 0, 0, 0, 1, 0xff, 0xfe];
        assert_eq!(Frame::decode(&data), Err(FrameError::InvalidUtf8));
    }
}
