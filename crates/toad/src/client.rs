//! The handle collaborators use to address one connection.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, Result,
    close::CloseCode,
    connection::ConnectionState,
    frame::{Frame, OpCode},
    message::Message,
    ping::PingRecord,
};

/// A connected peer.
///
/// `Client` is a cheap, clonable handle. Sends never wait for the network:
/// frames are queued to the connection's single writer task, which keeps them
/// in order. Once the connection closes every send fails with
/// [`Error::ConnectionClosed`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    closing: AtomicBool,
    tx: UnboundedSender<Frame>,
    pings: Mutex<PingRecord>,
    shutdown: CancellationToken,
}

impl Client {
    pub(crate) fn new(
        id: u64,
        peer: Option<SocketAddr>,
        tx: UnboundedSender<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                peer,
                state: AtomicU8::new(ConnectionState::AwaitingHandshake as u8),
                closing: AtomicBool::new(false),
                tx,
                pings: Mutex::new(PingRecord::new()),
                shutdown,
            }),
        }
    }

    /// Process-wide unique id, issued in accept order and never reused.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// `true` between a successful handshake and the start of closing.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queues a text or binary message.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.send_data(Frame::from(message.into()))
    }

    /// Serializes `value` as JSON and queues it as a text message.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send(text)
    }

    /// Sends a ping carrying a fresh token; the matching pong updates
    /// [`last_rtt`](Self::last_rtt).
    pub fn ping(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let token = self.inner.pings.lock().issue(Instant::now());
        self.send_frame(Frame::ping(Bytes::copy_from_slice(&token)))
    }

    /// Starts a normal closure: sends a close frame and stops the read loop.
    ///
    /// Calling it again, or on a closed connection, does nothing.
    pub fn close(&self) {
        self.close_with(CloseCode::Normal);
    }

    /// Most recent measured round-trip time.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.inner.pings.lock().last_rtt()
    }

    pub fn last_rtt_seconds(&self) -> Option<f64> {
        self.last_rtt().map(|rtt| rtt.as_secs_f64())
    }

    pub fn last_rtt_ms(&self) -> Option<f64> {
        self.last_rtt().map(|rtt| rtt.as_secs_f64() * 1000.0)
    }

    /// Every measured round-trip time, oldest first.
    pub fn rtt_history(&self) -> Vec<Duration> {
        self.inner.pings.lock().history().to_vec()
    }

    fn send_data(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.send_frame(frame)
    }

    /// Queues a frame regardless of the open flag.
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<()> {
        self.inner
            .tx
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) fn handle_pong(&self, payload: &[u8]) -> Option<Duration> {
        self.inner.pings.lock().resolve(payload, Instant::now())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn close_with(&self, code: CloseCode) {
        self.send_close(Frame::close(code, ""));
    }

    /// Sends `frame` (a close frame) unless one was already sent, then stops
    /// the read loop. The writer task exits after writing it.
    pub(crate) fn send_close(&self, frame: Frame) {
        debug_assert_eq!(frame.opcode(), OpCode::Close);
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.send_frame(frame);
        self.inner.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Client {}
