//! One client's connection, from the first request byte to the last frame.
//!
//! ```text
//! AwaitingHandshake ──ok──▶ Open ──close frame / stop / error / EOF──▶ Closing ──▶ Closed
//!         └────────────────────── bad handshake ─────────────────────────────────────▲
//! ```
//!
//! Reading happens on the connection's own task. Writing happens on a
//! separate writer task fed by an unbounded channel, so a `send` from any
//! callback (of any connection) never waits on this peer's socket and the
//! frames of one connection always leave in the order they were queued.

use std::{net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    Error, Result,
    assemble::Reassembler,
    callbacks::Target,
    client::Client,
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode},
    handshake::{self, Request},
    hub::Hub,
};

/// How long the writer gets to flush its queue after the connection closed.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a connection, as seen through [`Client::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted, upgrade request not yet answered.
    AwaitingHandshake = 0,
    /// Handshake done; frames flow.
    Open = 1,
    /// A close was initiated (by either side); no further frames are read.
    Closing = 2,
    /// Deregistered and the `close` event delivered.
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::AwaitingHandshake,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Drives one accepted stream through the whole lifecycle.
pub(crate) async fn serve<S, IO>(hub: Hub<S>, io: IO, peer: Option<SocketAddr>)
where
    S: Send + Sync + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let options = hub.options().clone();
    let (mut reader, mut writer) = tokio::io::split(io);
    let (tx, rx) = mpsc::unbounded_channel();
    let client = Client::new(hub.next_id(), peer, tx, CancellationToken::new());
    let client_id = client.id();

    let mut buf = BytesMut::new();
    let accept = match handshake::read_head(&mut reader, &mut buf, options.max_handshake_size)
        .await
        .and_then(|head| head.map(|head| Request::parse(&head)?.negotiate()).transpose())
    {
        Ok(Some(accept)) => accept,
        Ok(None) => {
            tracing::debug!(client_id, "stream ended before the handshake completed");
            client.set_state(ConnectionState::Closed);
            return;
        }
        Err(Error::Io(e)) => {
            tracing::debug!(client_id, error = %e, "handshake read failed");
            client.set_state(ConnectionState::Closed);
            return;
        }
        Err(err) => {
            reject(&hub, &client, &mut writer, err).await;
            return;
        }
    };

    let response = handshake::switching_protocols(&accept);
    if let Err(e) = write_response(&mut writer, &response).await {
        tracing::debug!(client_id, error = %e, "handshake write failed");
        client.set_state(ConnectionState::Closed);
        return;
    }

    let sink = FramedWrite::new(writer, Encoder::new());
    let writer_task = tokio::spawn(write_loop(sink, rx, options.fragment_size, client_id));

    let mut frames = FramedRead::new(
        reader,
        Decoder::new(options.max_payload, options.accept_unmasked),
    );
    // bytes the client pipelined behind its request
    *frames.read_buffer_mut() = buf;

    client.set_state(ConnectionState::Open);
    hub.registry().register(client.clone());
    tracing::info!(client_id, peer = ?peer, "client connected");

    let target = hub.callbacks().fire_open(&client);
    read_loop(&hub, &target, &mut frames, Reassembler::new(options.message_limit())).await;

    // every way out of the read loop ends with a close frame on the wire
    client.close_with(CloseCode::Normal);
    client.set_state(ConnectionState::Closing);
    hub.registry().deregister(client_id);
    hub.callbacks().fire_close(&target);
    client.set_state(ConnectionState::Closed);
    tracing::info!(client_id, "client disconnected");

    drop(frames);
    finish_writer(writer_task, client_id).await;
}

async fn read_loop<S, R>(
    hub: &Hub<S>,
    target: &Target<S>,
    frames: &mut FramedRead<R, Decoder>,
    mut reassembler: Reassembler,
) where
    S: Send + Sync + 'static,
    R: AsyncRead + Unpin,
{
    let client = target.client();
    let client_id = client.id();
    let shutdown = client.shutdown_token().clone();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            None => {
                tracing::debug!(client_id, "peer closed the stream");
                return;
            }
            Some(Err(Error::Io(e))) => {
                tracing::debug!(client_id, error = %e, "read failed");
                return;
            }
            Some(Err(err)) => {
                abort(hub, target, err);
                return;
            }
        };

        match frame.opcode() {
            OpCode::Close => {
                tracing::debug!(client_id, code = ?frame.close_code(), "close frame received");
                let reply = match frame.close_code() {
                    Some(code) if code.is_allowed() => Frame::close(code, ""),
                    None if frame.payload().is_empty() => Frame::close_raw(Bytes::new()),
                    // one-byte payloads and codes that never go on the wire
                    _ => Frame::close(CloseCode::Protocol, ""),
                };
                client.send_close(reply);
                return;
            }
            OpCode::Ping => {
                let _ = client.send_frame(Frame::pong(frame.into_payload()));
            }
            OpCode::Pong => {
                if let Some(rtt) = client.handle_pong(frame.payload()) {
                    tracing::debug!(client_id, ?rtt, "pong received");
                }
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => match reassembler.push(frame) {
                Ok(Some(message)) => {
                    if hub.callbacks().fire_message(target, &message).is_some() {
                        tracing::debug!(client_id, "message handler asked to stop");
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    abort(hub, target, err);
                    return;
                }
            },
        }
    }
}

/// Reports a protocol failure and closes with the matching status code.
fn abort<S: Send + Sync + 'static>(hub: &Hub<S>, target: &Target<S>, err: Error) {
    let client = target.client();
    tracing::warn!(client_id = client.id(), error = %err, "closing connection");
    hub.callbacks().fire_error(target, &err);
    client.close_with(err.close_code());
}

/// Answers a bad upgrade request with 400 and reports it; the client never
/// becomes open.
async fn reject<S, W>(hub: &Hub<S>, client: &Client, writer: &mut W, err: Error)
where
    S: Send + Sync + 'static,
    W: AsyncWrite + Unpin,
{
    tracing::warn!(client_id = client.id(), error = %err, "handshake rejected");
    if let Err(e) = write_response(writer, &handshake::bad_request()).await {
        tracing::debug!(client_id = client.id(), error = %e, "failed to send 400");
    }
    let _ = writer.shutdown().await;

    hub.callbacks()
        .fire_error(&Target::new(client.clone(), None), &err);
    client.set_state(ConnectionState::Closed);
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &str) -> Result<()> {
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes queued frames in order until a close frame went out.
async fn write_loop<W>(
    mut sink: FramedWrite<WriteHalf<W>, Encoder>,
    mut rx: UnboundedReceiver<Frame>,
    fragment_size: Option<usize>,
    client_id: u64,
) -> Result<()>
where
    W: AsyncWrite,
{
    while let Some(frame) = rx.recv().await {
        let opcode = frame.opcode();
        match fragment_size {
            Some(size) if !opcode.is_control() => {
                for fragment in frame.into_fragments(size) {
                    sink.feed(fragment).await?;
                }
            }
            _ => sink.feed(frame).await?,
        }

        if opcode == OpCode::Close {
            tracing::debug!(client_id, "close frame sent");
            break;
        }
        if rx.is_empty() {
            sink.flush().await?;
        }
    }

    sink.close().await
}

async fn finish_writer(mut writer_task: JoinHandle<Result<()>>, client_id: u64) {
    match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::debug!(client_id, error = %e, "writer stopped"),
        Ok(Err(e)) => tracing::warn!(client_id, error = %e, "writer task failed"),
        Err(_) => {
            tracing::debug!(client_id, "writer did not drain in time");
            writer_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::codec::{Decoder as _, Encoder as _};

    use super::*;
    use crate::{Options, ProtocolViolation};

    const REQUEST: &str = "GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    /// The browser side of a duplex connection.
    struct Peer {
        io: DuplexStream,
        decoder: Decoder,
        buf: BytesMut,
    }

    impl Peer {
        async fn connect<S: Send + Sync + 'static>(hub: &Hub<S>) -> Self {
            let (mut io, server) = tokio::io::duplex(1 << 20);
            let hub = hub.clone();
            tokio::spawn(async move { hub.handle(server, None).await });

            io.write_all(REQUEST.as_bytes()).await.unwrap();
            let mut peer = Self {
                io,
                decoder: Decoder::new(usize::MAX, true),
                buf: BytesMut::new(),
            };
            let head = peer.read_head().await;
            assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
            assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
            peer
        }

        async fn read_head(&mut self) -> String {
            let head = handshake::read_head(&mut self.io, &mut self.buf, 8192)
                .await
                .unwrap()
                .unwrap();
            String::from_utf8(head.to_vec()).unwrap()
        }

        async fn send(&mut self, frame: Frame) {
            let mut dst = BytesMut::new();
            Encoder.encode(frame.with_random_mask(), &mut dst).unwrap();
            self.io.write_all(&dst).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                if self.io.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        }
    }

    /// The handshake answer goes out before the client is registered.
    async fn first_client<S: Send + Sync + 'static>(hub: &Hub<S>) -> Client {
        loop {
            if let Some(client) = hub.open_clients().into_iter().next() {
                return client;
            }
            tokio::task::yield_now().await;
        }
    }

    fn echo_hub() -> Hub {
        let hub: Hub = Hub::default();
        hub.on_message(|target, message| {
            let _ = target.client().send(message.clone());
            None
        });
        hub
    }

    #[tokio::test]
    async fn test_echo_text_and_binary() {
        let hub = echo_hub();
        let mut peer = Peer::connect(&hub).await;

        peer.send(Frame::text("Hello")).await;
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.opcode(), OpCode::Text);
        assert!(!frame.is_masked());
        assert_eq!(frame.payload().as_ref(), b"Hello");

        peer.send(Frame::binary(vec![1u8, 2, 3])).await;
        assert_eq!(peer.recv().await.unwrap().payload().as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fragmented_message_with_interleaved_ping() {
        let hub = echo_hub();
        let mut peer = Peer::connect(&hub).await;

        peer.send(Frame::text("Hel").with_fin(false)).await;
        peer.send(Frame::ping("p")).await;
        peer.send(Frame::continuation("lo ").with_fin(false)).await;
        peer.send(Frame::continuation("World")).await;

        let pong = peer.recv().await.unwrap();
        assert_eq!(pong.opcode(), OpCode::Pong);
        assert_eq!(pong.payload().as_ref(), b"p");

        let echo = peer.recv().await.unwrap();
        assert_eq!(echo.payload().as_ref(), b"Hello World");
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let hub = echo_hub();
        let closed = Arc::new(Mutex::new(Vec::new()));
        {
            let closed = closed.clone();
            hub.on_close(move |target| closed.lock().push(target.client().id()));
        }

        let mut peer = Peer::connect(&hub).await;
        let id = first_client(&hub).await.id();

        peer.send(Frame::close(CloseCode::Away, "bye")).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.opcode(), OpCode::Close);
        assert_eq!(reply.close_code(), Some(CloseCode::Away));
        assert!(peer.recv().await.is_none());

        while hub.client(id).is_some() {
            tokio::task::yield_now().await;
        }
        assert_eq!(*closed.lock(), vec![id]);
        assert!(hub.open_clients().is_empty());
    }

    #[tokio::test]
    async fn test_close_reply_replaces_invalid_codes() {
        for (payload, expected) in [
            (vec![], None),
            (vec![0x03], Some(CloseCode::Protocol)),
            (1005u16.to_be_bytes().to_vec(), Some(CloseCode::Protocol)),
            (1006u16.to_be_bytes().to_vec(), Some(CloseCode::Protocol)),
            (999u16.to_be_bytes().to_vec(), Some(CloseCode::Protocol)),
            (4001u16.to_be_bytes().to_vec(), Some(CloseCode::Other(4001))),
        ] {
            let hub = echo_hub();
            let mut peer = Peer::connect(&hub).await;

            peer.send(Frame::close_raw(payload.clone())).await;
            let reply = peer.recv().await.unwrap();
            assert_eq!(reply.opcode(), OpCode::Close);
            assert_eq!(reply.close_code(), expected, "{payload:?}");
            assert!(peer.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_stop_closes_connection() {
        let hub: Hub = Hub::default();
        hub.on_message(|_, message| (message.as_text() == Some("quit")).then_some(crate::Stop));

        let mut peer = Peer::connect(&hub).await;
        peer.send(Frame::text("quit")).await;

        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_protocol_violation_reports_error_and_closes() {
        let hub: Hub = Hub::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            hub.on_error(move |_, error| errors.lock().push(error.to_string()));
        }

        let mut peer = Peer::connect(&hub).await;
        peer.send(Frame::continuation("orphan")).await;

        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.close_code(), Some(CloseCode::Protocol));
        assert_eq!(
            *errors.lock(),
            vec![Error::from(ProtocolViolation::UnexpectedContinuation).to_string()]
        );
    }

    #[tokio::test]
    async fn test_unmasked_frame_rejected() {
        let hub: Hub = Hub::default();
        let mut peer = Peer::connect(&hub).await;

        let mut dst = BytesMut::new();
        Encoder.encode(Frame::text("naked"), &mut dst).unwrap();
        peer.io.write_all(&dst).await.unwrap();

        assert_eq!(
            peer.recv().await.unwrap().close_code(),
            Some(CloseCode::Protocol)
        );
    }

    #[tokio::test]
    async fn test_unmasked_frame_accepted_when_configured() {
        let hub: Hub = Hub::new(Options::default().with_accept_unmasked());
        hub.on_message(|target, message| {
            let _ = target.client().send(message.clone());
            None
        });
        let mut peer = Peer::connect(&hub).await;

        let mut dst = BytesMut::new();
        Encoder.encode(Frame::text("naked"), &mut dst).unwrap();
        peer.io.write_all(&dst).await.unwrap();

        assert_eq!(peer.recv().await.unwrap().payload().as_ref(), b"naked");
    }

    #[tokio::test]
    async fn test_session_from_open_handler() {
        let hub: Hub<String> = Hub::default();
        hub.on_open(|client| Some(format!("player-{}", client.id())));
        hub.on_message(|target, _| {
            let name = target.session().cloned().unwrap_or_default();
            let _ = target.client().send(name);
            None
        });

        let mut peer = Peer::connect(&hub).await;
        peer.send(Frame::text("who am i")).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.payload().as_ref(), b"player-1");
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_connection() {
        let hub: Hub = Hub::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            hub.on_error(move |_, error| errors.lock().push(error.to_string()));
        }
        hub.on_message(|target, message| {
            if message.as_text() == Some("explode") {
                panic!("kaboom");
            }
            let _ = target.client().send("still here");
            None
        });

        let mut peer = Peer::connect(&hub).await;
        peer.send(Frame::text("explode")).await;
        peer.send(Frame::text("hello")).await;

        assert_eq!(peer.recv().await.unwrap().payload().as_ref(), b"still here");
        assert_eq!(
            *errors.lock(),
            vec!["message callback panicked: kaboom".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_outbound_fragmentation() {
        let hub: Hub = Hub::new(Options::default().with_fragment_size(4));
        hub.on_message(|target, _| {
            let _ = target.client().send("Hello World");
            None
        });

        let mut peer = Peer::connect(&hub).await;
        peer.send(Frame::text("go")).await;

        let mut parts = Vec::new();
        loop {
            let frame = peer.recv().await.unwrap();
            let fin = frame.is_fin();
            parts.push((frame.opcode(), frame.into_payload()));
            if fin {
                break;
            }
        }
        assert_eq!(
            parts,
            vec![
                (OpCode::Text, Bytes::from_static(b"Hell")),
                (OpCode::Continuation, Bytes::from_static(b"o Wo")),
                (OpCode::Continuation, Bytes::from_static(b"rld")),
            ]
        );
    }

    #[tokio::test]
    async fn test_pipelined_frame_after_handshake() {
        let hub = echo_hub();
        let (mut io, server) = tokio::io::duplex(1 << 16);
        tokio::spawn({
            let hub = hub.clone();
            async move { hub.handle(server, None).await }
        });

        let mut bytes = BytesMut::from(REQUEST.as_bytes());
        Encoder
            .encode(Frame::text("early").with_random_mask(), &mut bytes)
            .unwrap();
        io.write_all(&bytes).await.unwrap();

        let mut peer = Peer {
            io,
            decoder: Decoder::new(usize::MAX, true),
            buf: BytesMut::new(),
        };
        assert!(peer.read_head().await.contains("101"));
        assert_eq!(peer.recv().await.unwrap().payload().as_ref(), b"early");
    }

    #[tokio::test]
    async fn test_bad_handshake() {
        let hub: Hub = Hub::default();
        let opened = Arc::new(Mutex::new(0usize));
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let opened = opened.clone();
            hub.on_open(move |_| {
                *opened.lock() += 1;
                None
            });
            let errors = errors.clone();
            hub.on_error(move |target, error| {
                errors.lock().push((target.client().is_open(), error.is_handshake_error()));
            });
        }

        let (mut io, server) = tokio::io::duplex(4096);
        let task = tokio::spawn({
            let hub = hub.clone();
            async move { hub.handle(server, None).await }
        });

        io.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        io.read_to_string(&mut response).await.unwrap();
        task.await.unwrap();

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(*opened.lock(), 0);
        assert_eq!(*errors.lock(), vec![(false, true)]);
        assert!(hub.open_clients().is_empty());
    }

    #[tokio::test]
    async fn test_eof_before_handshake_is_silent() {
        let hub: Hub = Hub::default();
        let events = Arc::new(Mutex::new(0usize));
        {
            let events = events.clone();
            hub.on_error(move |_, _| *events.lock() += 1);
        }

        let (io, server) = tokio::io::duplex(4096);
        drop(io);
        hub.handle(server, None).await;
        assert_eq!(*events.lock(), 0);
    }

    #[tokio::test]
    async fn test_server_ping_measures_rtt() {
        let hub: Hub = Hub::default();
        let mut peer = Peer::connect(&hub).await;
        let client = first_client(&hub).await;

        client.ping().unwrap();
        let ping = peer.recv().await.unwrap();
        assert_eq!(ping.opcode(), OpCode::Ping);

        // an unsolicited pong first, then the real answer
        peer.send(Frame::pong("nobody asked")).await;
        peer.send(Frame::pong(ping.into_payload())).await;

        while client.last_rtt().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.rtt_history().len(), 1);
        assert!(client.last_rtt_seconds().unwrap() >= 0.0);
    }
}
