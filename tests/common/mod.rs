//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::Router;
use observing_proxy::config::ProxyConfig;
use observing_proxy::lifecycle::Shutdown;
use observing_proxy::protocol::{Frame, Packet};
use observing_proxy::{HttpServer, MemorySink, Observer};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a recording backend saw on the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// Read one request with a `Content-Length` (or no) body.
async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut request = RecordedRequest {
        head,
        body: buf[head_end..].to_vec(),
    };
    let length: usize = request
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while request.body.len() < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        request.body.extend_from_slice(&chunk[..n]);
    }
    Some(request)
}

/// Bind an ephemeral local port.
pub async fn ephemeral_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let (listener, addr) = ephemeral_listener().await;
    drop(listener);
    addr
}

/// Backend that records each request and answers with `response` verbatim.
pub async fn start_raw_backend(
    response: &'static [u8],
) -> (SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>) {
    let (listener, addr) = ephemeral_listener().await;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut socket).await {
                    let _ = tx.send(request);
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });

    (addr, rx)
}

/// Backend that answers with `prefix` and then holds the socket open
/// without sending anything more.
pub async fn start_stalling_backend(prefix: &'static [u8]) -> SocketAddr {
    let (listener, addr) = ephemeral_listener().await;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_some() {
                    let _ = socket.write_all(prefix).await;
                    std::future::pending::<()>().await;
                }
            });
        }
    });
    addr
}

/// Backend answering every request with `200` and a fixed body.
pub async fn start_mock_backend(
    body: &'static str,
) -> (SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    start_raw_backend(Box::leak(response.into_bytes().into_boxed_slice())).await
}

/// Backend that accepts connections and never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let (listener, addr) = ephemeral_listener().await;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Event-stream backend over WebSocket.
///
/// Sends an open packet and a namespace connect, echoes everything else,
/// and answers events that carry an ack id with `["ok"]`.
pub async fn start_socket_backend() -> SocketAddr {
    async fn upgrade(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(serve_socket)
    }

    let (listener, addr) = ephemeral_listener().await;
    let app = Router::new().fallback(upgrade);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn serve_socket(mut socket: WebSocket) {
    let open = r#"0{"sid":"test","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#;
    if socket.send(Message::Text(open.to_string().into())).await.is_err() {
        return;
    }
    if socket.send(Message::Text("40".to_string().into())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Text(text) => match Frame::decode(text.as_str()) {
                Ok(Frame::Message(packet)) if packet.kind.is_event() && packet.ack_id.is_some() => {
                    let ack = Packet::ack(packet.ack_id.unwrap_or_default(), vec![json!("ok")])
                        .with_namespace(&packet.namespace);
                    Message::Text(Frame::Message(ack).encode().into())
                }
                Ok(Frame::Ping(payload)) => Message::Text(Frame::Pong(payload).encode().into()),
                _ => Message::Text(text),
            },
            Message::Binary(data) => Message::Binary(data),
            Message::Close(frame) => {
                let _ = socket.send(Message::Close(frame)).await;
                break;
            }
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

/// A proxy running in the background with its captures in memory.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub sink: MemorySink,
    pub shutdown: Shutdown,
    pub server: JoinHandle<std::io::Result<()>>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Start a proxy in front of `upstream`; `tweak` adjusts the config.
pub async fn start_proxy(
    upstream: SocketAddr,
    tweak: impl FnOnce(&mut ProxyConfig),
) -> TestProxy {
    let (listener, addr) = ephemeral_listener().await;

    let mut config = ProxyConfig::default();
    config.listener.bind_address = addr.to_string();
    config.upstream.host = upstream.ip().to_string();
    config.upstream.port = upstream.port();
    config.timeouts.connect_secs = 2;
    config.timeouts.request_secs = 5;
    tweak(&mut config);

    let sink = MemorySink::new();
    let observer = Observer::spawn(sink.clone(), config.capture.queue_capacity);
    let server = HttpServer::with_observer(config, observer);

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let server = tokio::spawn(server.run(listener, server_shutdown));

    TestProxy {
        addr,
        sink,
        shutdown,
        server,
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Poll the sink until `done` holds or two seconds pass.
pub async fn wait_for_lines(sink: &MemorySink, done: impl Fn(&[String]) -> bool) -> Vec<String> {
    for _ in 0..200 {
        let lines = sink.lines();
        if done(&lines) {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sink.lines()
}

pub fn has_line(lines: &[String], prefix: &str) -> bool {
    lines.iter().any(|l| l.starts_with(prefix))
}
