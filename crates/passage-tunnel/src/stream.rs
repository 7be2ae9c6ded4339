//! Flow-controlled logical streams
//!
//! A [`TunnelStream`] is one full-duplex byte channel within a session,
//! conforming to a TCP-like connection (`AsyncRead + AsyncWrite`). Byte order
//! is preserved within a stream; streams in the same session are independent.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::frame::{Frame, INITIAL_WINDOW, MAX_DATA_FRAME};

/// Shared per-stream state, visible to both the stream handle and the
/// session demux loop
pub(crate) struct StreamState {
    pub(crate) id: u32,
    /// Bytes we may still send before the peer must grant credit
    send_window: AtomicI64,
    /// Bytes the peer may still send before we must grant credit.
    /// Going negative means the peer violated the window.
    recv_window: AtomicI64,
    closed: AtomicBool,
    write_waker: Mutex<Option<Waker>>,
    close_reason: Mutex<Option<String>>,
}

impl StreamState {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            send_window: AtomicI64::new(INITIAL_WINDOW as i64),
            recv_window: AtomicI64::new(INITIAL_WINDOW as i64),
            closed: AtomicBool::new(false),
            write_waker: Mutex::new(None),
            close_reason: Mutex::new(None),
        }
    }

    /// Grant send credit received from the peer and unpark the writer
    pub(crate) fn add_send_credit(&self, credit: u32) {
        self.send_window.fetch_add(credit as i64, Ordering::AcqRel);
        self.wake_writer();
    }

    /// Account for inbound payload bytes. Returns false when the peer has
    /// overrun the advertised window.
    pub(crate) fn take_recv(&self, n: usize) -> bool {
        self.recv_window.fetch_sub(n as i64, Ordering::AcqRel) >= n as i64
    }

    /// Account for credit we granted back to the peer
    fn grant_recv(&self, n: u32) {
        self.recv_window.fetch_add(n as i64, Ordering::AcqRel);
    }

    /// Mark the stream closed, recording the first failure reason seen
    pub(crate) fn close(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            if !reason.is_empty() {
                let mut slot = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
                slot.get_or_insert(reason);
            }
        }
        self.closed.store(true, Ordering::Release);
        self.wake_writer();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn wake_writer(&self) {
        let waker = {
            let mut slot = self.write_waker.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn park_writer(&self, waker: &Waker) {
        let mut slot = self.write_waker.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(waker.clone());
    }
}

/// Session-side handle for delivering inbound payloads to a stream
pub(crate) struct StreamEntry {
    pub(crate) data_tx: mpsc::UnboundedSender<Bytes>,
    pub(crate) state: Arc<StreamState>,
}

/// One logical, full-duplex byte channel within a session
pub struct TunnelStream {
    state: Arc<StreamState>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    readbuf: Bytes,
    /// Bytes consumed since the last window grant
    consumed: u32,
    control: mpsc::UnboundedSender<Frame>,
    data_out: PollSender<Frame>,
    streams: Arc<DashMap<u32, StreamEntry>>,
    close_sent: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        state: Arc<StreamState>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        control: mpsc::UnboundedSender<Frame>,
        data_out: mpsc::Sender<Frame>,
        streams: Arc<DashMap<u32, StreamEntry>>,
    ) -> Self {
        Self {
            state,
            data_rx,
            readbuf: Bytes::new(),
            consumed: 0,
            control,
            data_out: PollSender::new(data_out),
            streams,
            close_sent: false,
        }
    }

    /// The stream id within its session
    pub fn id(&self) -> u32 {
        self.state.id
    }

    fn send_close(&mut self, reason: &str) {
        if !self.close_sent {
            self.close_sent = true;
            let _ = self.control.send(Frame::Close {
                stream_id: self.state.id,
                reason: reason.to_string(),
            });
        }
    }

    /// Close the stream with a failure reason, notifying the peer
    pub(crate) fn close_with_reason(&mut self, reason: &str) {
        self.send_close(reason);
        self.state.close(Some(reason.to_string()));
    }

    /// Replenish the peer's send window once we've consumed half of ours
    fn maybe_grant_window(&mut self) {
        if self.consumed >= INITIAL_WINDOW / 2 {
            let _ = self.control.send(Frame::WindowUpdate {
                stream_id: self.state.id,
                credit: self.consumed,
            });
            self.state.grant_recv(self.consumed);
            self.consumed = 0;
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.readbuf.is_empty() {
                let n = self.readbuf.len().min(buf.remaining());
                let chunk = self.readbuf.split_to(n);
                buf.put_slice(&chunk);
                self.consumed += n as u32;
                self.maybe_grant_window();
                return Poll::Ready(Ok(()));
            }

            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    self.readbuf = bytes;
                }
                Poll::Ready(None) => {
                    // Peer closed. A failure reason surfaces as an error,
                    // a clean close as EOF.
                    return match self.state.close_reason() {
                        Some(reason) => Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            reason,
                        ))),
                        None => Poll::Ready(Ok(())),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.state.is_closed() {
            let reason = self
                .state
                .close_reason()
                .unwrap_or_else(|| "stream closed".to_string());
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, reason)));
        }

        let window = self.state.send_window.load(Ordering::Acquire);
        if window <= 0 {
            self.state.park_writer(cx.waker());
            // Re-check after parking so a concurrent credit grant cannot be lost
            if self.state.send_window.load(Ordering::Acquire) > 0 || self.state.is_closed() {
                cx.waker().wake_by_ref();
            }
            return Poll::Pending;
        }

        match self.data_out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = buf.len().min(window as usize).min(MAX_DATA_FRAME);
                let frame = Frame::Data {
                    stream_id: self.state.id,
                    payload: Bytes::copy_from_slice(&buf[..chunk]),
                };
                if self.data_out.send_item(frame).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "session closed",
                    )));
                }
                self.state.send_window.fetch_sub(chunk as i64, Ordering::AcqRel);
                Poll::Ready(Ok(chunk))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are handed to the session writer as complete frames
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.send_close("");
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.send_close("");
        self.streams.remove(&self.state.id);
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.state.id)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}
