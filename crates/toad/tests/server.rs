//! End-to-end tests against a real listener on 127.0.0.1.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{Decoder as _, Encoder as _};
use toad::{
    CloseCode, Frame, Hub, OpCode, Server, ServerConfig, Stop,
    codec::{Decoder, Encoder},
    handshake,
};

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
const WAIT: Duration = Duration::from_secs(5);

struct TestServer<S = ()> {
    addr: SocketAddr,
    hub: Hub<S>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<toad::Result<()>>,
}

impl<S: Send + Sync + 'static> TestServer<S> {
    async fn start(config: ServerConfig, setup: impl FnOnce(&Hub<S>)) -> Self {
        let server = Server::new(config);
        setup(server.hub());
        let hub = server.hub().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        Self {
            addr,
            hub,
            shutdown: Some(tx),
            task,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }

    async fn wait_for_open(&self, count: usize) {
        timeout(WAIT, async {
            while self.hub.open_clients().len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("clients did not open in time");
    }
}

/// A minimal browser: masks every frame it sends.
struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    decoder: Decoder,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (client, response) = Self::request(
            addr,
            &format!(
                "GET /chat HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
            ),
        )
        .await;
        assert!(
            response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "{response}"
        );
        assert!(response.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")));
        client
    }

    async fn request(addr: SocketAddr, request: &str) -> (Self, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = BytesMut::new();
        let head = timeout(WAIT, handshake::read_head(&mut stream, &mut buf, 8192))
            .await
            .unwrap()
            .unwrap()
            .expect("no response head");
        let client = Self {
            stream,
            buf,
            decoder: Decoder::new(usize::MAX, true),
        };
        (client, String::from_utf8(head.to_vec()).unwrap())
    }

    async fn send(&mut self, frame: Frame) {
        let mut dst = BytesMut::new();
        Encoder::new().encode(frame.with_random_mask(), &mut dst).unwrap();
        self.stream.write_all(&dst).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Frame> {
        timeout(WAIT, async {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    async fn recv_text(&mut self) -> String {
        let frame = self.recv().await.expect("connection closed");
        assert_eq!(frame.opcode(), OpCode::Text);
        String::from_utf8(frame.into_payload().to_vec()).unwrap()
    }
}

fn echo(hub: &Hub) {
    hub.on_message(|target, message| {
        if let Some(text) = message.as_text() {
            let _ = target.client().send(format!("You said: {text}"));
        }
        None
    });
}

#[tokio::test]
async fn handshake_and_echo() {
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), echo).await;

    let mut client = TestClient::connect(server.addr).await;
    client.send(Frame::text("hi")).await;
    assert_eq!(client.recv_text().await, "You said: hi");

    server.stop().await;
}

#[tokio::test]
async fn missing_version_is_rejected_without_open() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), |hub: &Hub| {
        let opens = events.clone();
        hub.on_open(move |_| {
            opens.lock().push("open".to_owned());
            None
        });
        let errors = events.clone();
        hub.on_error(move |target, error| {
            assert!(!target.client().is_open());
            match error {
                toad::Error::BadHandshake { request, .. } => {
                    assert!(request.starts_with("GET / HTTP/1.1\r\n"));
                    errors.lock().push("bad handshake".to_owned());
                }
                other => errors.lock().push(other.to_string()),
            }
        });
    })
    .await;

    let (mut client, response) = TestClient::request(
        server.addr,
        &format!("GET / HTTP/1.1\r\nHost: localhost\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(client.recv().await.is_none());

    timeout(WAIT, async {
        while events.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*events.lock(), vec!["bad handshake".to_owned()]);
    assert!(server.hub.open_clients().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn fragmented_message_is_reassembled() {
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), echo).await;
    let mut client = TestClient::connect(server.addr).await;

    client.send(Frame::text("Hel").with_fin(false)).await;
    client.send(Frame::continuation("lo ").with_fin(false)).await;
    client.send(Frame::continuation("World")).await;
    assert_eq!(client.recv_text().await, "You said: Hello World");

    server.stop().await;
}

#[tokio::test]
async fn oversized_frame_closes_only_its_connection() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let config = ServerConfig::new("127.0.0.1", 0)
        .with_options(toad::Options::default().with_max_payload(1024));
    let server = TestServer::start(config, |hub: &Hub| {
        echo(hub);
        let errors = errors.clone();
        hub.on_error(move |target, error| {
            errors.lock().push((target.client().id(), error.close_code()));
        });
    })
    .await;

    let mut good = TestClient::connect(server.addr).await;
    let mut bad = TestClient::connect(server.addr).await;
    server.wait_for_open(2).await;
    let ids: Vec<u64> = server.hub.open_clients().iter().map(|c| c.id()).collect();

    // binary frame declaring 200 MiB, masked, no payload
    let mut header = vec![0x82, 0xFF];
    header.extend_from_slice(&(200u64 * 1024 * 1024).to_be_bytes());
    header.extend_from_slice(&[1, 2, 3, 4]);
    bad.send_raw(&header).await;

    let close = bad.recv().await.expect("close frame");
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close.close_code(), Some(CloseCode::Size));
    assert!(bad.recv().await.is_none());

    good.send(Frame::text("still alive")).await;
    assert_eq!(good.recv_text().await, "You said: still alive");

    server.wait_for_open(1).await;
    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1, CloseCode::Size);
    assert!(ids.contains(&errors[0].0));

    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_only_open_clients() {
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), |hub: &Hub| {
        hub.on_message(|_, message| (message.as_text() == Some("bye")).then_some(Stop));
    })
    .await;

    let mut a = TestClient::connect(server.addr).await;
    let mut b = TestClient::connect(server.addr).await;
    server.wait_for_open(2).await;

    b.send(Frame::text("bye")).await;
    assert_eq!(b.recv().await.unwrap().close_code(), Some(CloseCode::Normal));
    server.wait_for_open(1).await;

    assert_eq!(server.hub.send_all("news"), 1);
    assert_eq!(a.recv_text().await, "news");
    assert!(b.recv().await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn ping_measures_round_trip_time() {
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), |_: &Hub| {}).await;
    let mut client = TestClient::connect(server.addr).await;
    server.wait_for_open(1).await;
    let handle = server.hub.open_clients().remove(0);

    // a pong nobody asked for changes nothing
    client.send(Frame::pong("unsolicited")).await;

    handle.ping().unwrap();
    let ping = client.recv().await.unwrap();
    assert_eq!(ping.opcode(), OpCode::Ping);
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.send(Frame::pong(ping.into_payload())).await;

    timeout(WAIT, async {
        while handle.last_rtt().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let seconds = handle.last_rtt_seconds().unwrap();
    assert!(seconds > 0.0, "{seconds}");
    assert_eq!(handle.rtt_history().len(), 1);
    assert!(handle.last_rtt_ms().unwrap() >= 10.0);

    server.stop().await;
}

#[tokio::test]
async fn client_ping_is_answered() {
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), echo).await;
    let mut client = TestClient::connect(server.addr).await;

    client.send(Frame::ping("are you there")).await;
    let pong = client.recv().await.unwrap();
    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(&pong.payload()[..], b"are you there");

    server.stop().await;
}

#[tokio::test]
async fn tick_runs_with_the_server() {
    let ticks = Arc::new(Mutex::new(0usize));
    let config = ServerConfig::new("127.0.0.1", 0).with_tick(Duration::from_millis(20));
    let server = TestServer::start(config, |hub: &Hub| {
        let ticks = ticks.clone();
        hub.on_tick(move |hub| {
            *ticks.lock() += 1;
            hub.send_all("tick");
        });
    })
    .await;

    let mut client = TestClient::connect(server.addr).await;
    assert_eq!(client.recv_text().await, "tick");
    assert_eq!(client.recv_text().await, "tick");
    assert!(*ticks.lock() >= 2);

    server.stop().await;
    let after_stop = *ticks.lock();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*ticks.lock(), after_stop);
}

#[tokio::test]
async fn shutdown_closes_open_clients() {
    let server = TestServer::start(ServerConfig::new("127.0.0.1", 0), echo).await;
    let mut client = TestClient::connect(server.addr).await;
    server.wait_for_open(1).await;

    server.stop().await;
    let close = client.recv().await.unwrap();
    assert_eq!(close.close_code(), Some(CloseCode::Away));
}

#[tokio::test]
async fn close_frames_are_flushed_before_serve_returns() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let server: Server = Server::new(ServerConfig::new("127.0.0.1", 0));
    let hub = server.hub().clone();
    let (tx, rx) = oneshot::channel::<()>();

    // serve on a runtime of its own that is dropped as soon as serve returns
    let thread = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        })
    });

    let mut client = TestClient::connect(addr).await;
    timeout(WAIT, async {
        while hub.open_clients().len() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tx.send(()).unwrap();
    let close = client.recv().await.expect("no close frame before the runtime went away");
    assert_eq!(close.close_code(), Some(CloseCode::Away));

    tokio::task::spawn_blocking(move || thread.join())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
