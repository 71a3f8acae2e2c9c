//! WebSocket proxy handling.
//!
//! # Responsibilities
//! - Detect WebSocket upgrade requests
//! - Establish the upstream WebSocket before answering the client
//! - Complete upgrade handshake with client
//! - Relay frames both ways, observing each one in arrival order
//! - Correlate event acknowledgements across directions
//!
//! # Data Flow
//! ```text
//! Client ←──── WebSocket frames ────→ Proxy ←──── WebSocket frames ────→ Upstream
//!                                       │
//!                                       └─→ FrameLog → Observer
//! ```
//!
//! # Design Decisions
//! - One task and one select loop per upgraded connection; no locks
//! - Frame-level forwarding (no message buffering)
//! - Close frames propagated in both directions
//! - Ping/pong forwarded like any other frame

use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts,
    },
    http::{header, request::Parts, HeaderMap, HeaderName, Request},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame as UpstreamCloseFrame},
        Message as UpstreamMessage,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::capture::CaptureRecord;
use crate::error::ProxyError;
use crate::http::server::AppState;
use crate::net::ExchangeId;
use crate::observability::{Observation, Observer};
use crate::protocol::{AckTracker, Direction, FrameSummary};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headers the upstream handshake generates itself.
fn is_handshake_header(name: &HeaderName) -> bool {
    [
        header::HOST,
        header::CONNECTION,
        header::UPGRADE,
        header::SEC_WEBSOCKET_KEY,
        header::SEC_WEBSOCKET_VERSION,
        header::SEC_WEBSOCKET_EXTENSIONS,
        header::CONTENT_LENGTH,
    ]
    .contains(name)
}

/// True when the request asks for `Connection: upgrade` + `Upgrade: websocket`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && websocket
}

/// Connect upstream, then accept the client upgrade and start the relay.
///
/// The client only gets `101` once the upstream handshake succeeded, so a
/// dead upstream surfaces as a gateway error instead of an instantly
/// closed socket.
pub async fn proxy_upgrade(
    state: AppState,
    exchange: ExchangeId,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let (mut parts, _body) = request.into_parts();

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::warn!(
                exchange = %exchange,
                reason = %rejection.body_text(),
                "Rejected upgrade request"
            );
            return Ok(rejection.into_response());
        }
    };

    let (upstream, protocol) = connect_upstream(&state, &parts).await?;
    tracing::info!(
        exchange = %exchange,
        uri = %parts.uri,
        protocol = protocol.as_deref().unwrap_or("-"),
        "Upstream WebSocket connected"
    );

    let upgrade = match protocol {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };

    let settings = RelaySettings {
        idle_timeout: Duration::from_secs(state.config.timeouts.idle_secs),
        max_capture_bytes: state.config.capture.max_bytes,
        max_pending_acks: state.config.capture.max_pending_acks,
    };
    let observer = state.observer.clone();

    Ok(upgrade
        .on_failed_upgrade(move |e| {
            tracing::warn!(exchange = %exchange, error = %e, "Client upgrade failed");
        })
        .on_upgrade(move |client| relay(client, upstream, exchange, observer, settings)))
}

async fn connect_upstream(
    state: &AppState,
    parts: &Parts,
) -> Result<(UpstreamSocket, Option<String>), ProxyError> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("ws://{}{}", state.config.upstream.authority(), path);

    let mut request = target.as_str().into_client_request()?;
    for (name, value) in parts.headers.iter() {
        if !is_handshake_header(name) {
            request.headers_mut().append(name.clone(), value.clone());
        }
    }

    let connect_secs = state.config.timeouts.connect_secs;
    let (socket, response) = tokio::time::timeout(
        Duration::from_secs(connect_secs),
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| ProxyError::ConnectTimeout)??;

    let protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    Ok((socket, protocol))
}

/// Per-connection relay knobs.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub idle_timeout: Duration,
    pub max_capture_bytes: usize,
    pub max_pending_acks: usize,
}

async fn relay(
    client: WebSocket,
    upstream: UpstreamSocket,
    exchange: ExchangeId,
    observer: Observer,
    settings: RelaySettings,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let mut log = FrameLog::new(exchange, observer, settings.max_capture_bytes)
        .with_ack_limit(settings.max_pending_acks);

    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            message = client_rx.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(exchange = %exchange, error = %e, "Client read failed");
                        break "client error";
                    }
                    None => break "client disconnected",
                };
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);

                let (summary, payload) = describe_client(&message);
                log.record(Direction::ClientToUpstream, summary, payload);

                let closing = matches!(message, Message::Close(_));
                if let Err(e) = upstream_tx.send(to_upstream(message)).await {
                    tracing::debug!(exchange = %exchange, error = %e, "Upstream write failed");
                    break "upstream error";
                }
                if closing {
                    break "client closed";
                }
            }
            message = upstream_rx.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(exchange = %exchange, error = %e, "Upstream read failed");
                        break "upstream error";
                    }
                    None => break "upstream disconnected",
                };
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);

                // Raw frames never surface from a reading socket.
                let Some((summary, payload)) = describe_upstream(&message) else {
                    continue;
                };
                log.record(Direction::UpstreamToClient, summary, payload);

                let closing = matches!(message, UpstreamMessage::Close(_));
                let Some(message) = to_client(message) else {
                    continue;
                };
                if let Err(e) = client_tx.send(message).await {
                    tracing::debug!(exchange = %exchange, error = %e, "Client write failed");
                    break "client error";
                }
                if closing {
                    break "upstream closed";
                }
            }
            _ = &mut idle => break "idle timeout",
        }
    };

    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
    log.finish(reason);
}

fn describe_client(message: &Message) -> (FrameSummary, &[u8]) {
    match message {
        Message::Text(text) => (
            FrameSummary::from_text(text.as_str()),
            text.as_str().as_bytes(),
        ),
        Message::Binary(data) => (FrameSummary::Binary { len: data.len() }, data.as_ref()),
        Message::Ping(data) => (FrameSummary::Ping, data.as_ref()),
        Message::Pong(data) => (FrameSummary::Pong, data.as_ref()),
        Message::Close(Some(frame)) => (
            FrameSummary::Close {
                code: Some(frame.code),
                reason: frame.reason.as_str().to_owned(),
            },
            frame.reason.as_str().as_bytes(),
        ),
        Message::Close(None) => (
            FrameSummary::Close {
                code: None,
                reason: String::new(),
            },
            &[][..],
        ),
    }
}

fn describe_upstream(message: &UpstreamMessage) -> Option<(FrameSummary, &[u8])> {
    let described = match message {
        UpstreamMessage::Text(text) => (
            FrameSummary::from_text(text.as_str()),
            text.as_str().as_bytes(),
        ),
        UpstreamMessage::Binary(data) => {
            (FrameSummary::Binary { len: data.len() }, data.as_ref())
        }
        UpstreamMessage::Ping(data) => (FrameSummary::Ping, data.as_ref()),
        UpstreamMessage::Pong(data) => (FrameSummary::Pong, data.as_ref()),
        UpstreamMessage::Close(Some(frame)) => (
            FrameSummary::Close {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_owned(),
            },
            frame.reason.as_str().as_bytes(),
        ),
        UpstreamMessage::Close(None) => (
            FrameSummary::Close {
                code: None,
                reason: String::new(),
            },
            &[][..],
        ),
        UpstreamMessage::Frame(_) => return None,
    };
    Some(described)
}

fn to_upstream(message: Message) -> UpstreamMessage {
    match message {
        Message::Text(text) => UpstreamMessage::Text(text.as_str().to_owned().into()),
        Message::Binary(data) => UpstreamMessage::Binary(data),
        Message::Ping(data) => UpstreamMessage::Ping(data),
        Message::Pong(data) => UpstreamMessage::Pong(data),
        Message::Close(frame) => UpstreamMessage::Close(frame.map(|frame| UpstreamCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
    }
}

fn to_client(message: UpstreamMessage) -> Option<Message> {
    let message = match message {
        UpstreamMessage::Text(text) => Message::Text(text.as_str().to_owned().into()),
        UpstreamMessage::Binary(data) => Message::Binary(data),
        UpstreamMessage::Ping(data) => Message::Ping(data),
        UpstreamMessage::Pong(data) => Message::Pong(data),
        UpstreamMessage::Close(frame) => Message::Close(frame.map(|frame| CloseFrame {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
        UpstreamMessage::Frame(_) => return None,
    };
    Some(message)
}

/// Observation state for one upgraded connection.
///
/// Sequence numbers count every relayed frame per direction, observed or
/// not, starting at 1.
pub struct FrameLog {
    exchange: ExchangeId,
    observer: Observer,
    max_bytes: usize,
    client_seq: u64,
    upstream_seq: u64,
    acks: AckTracker,
}

impl FrameLog {
    pub fn new(exchange: ExchangeId, observer: Observer, max_bytes: usize) -> Self {
        Self {
            exchange,
            observer,
            max_bytes,
            client_seq: 0,
            upstream_seq: 0,
            acks: AckTracker::new(),
        }
    }

    /// Cap the callbacks held while waiting for their replies.
    pub fn with_ack_limit(mut self, limit: usize) -> Self {
        self.acks = AckTracker::with_limit(limit);
        self
    }

    /// Record one frame about to be forwarded in `direction`.
    pub fn record(&mut self, direction: Direction, summary: FrameSummary, payload: &[u8]) {
        let seq = match direction {
            Direction::ClientToUpstream => {
                self.client_seq += 1;
                self.client_seq
            }
            Direction::UpstreamToClient => {
                self.upstream_seq += 1;
                self.upstream_seq
            }
        };

        tracing::trace!(
            exchange = %self.exchange,
            direction = %direction,
            seq,
            bytes = payload.len(),
            "Relayed frame"
        );

        if !self.observer.is_enabled() {
            return;
        }

        let outcomes = summary
            .packet()
            .map(|packet| self.acks.observe(direction, packet))
            .unwrap_or_default();

        let mut record = CaptureRecord::new(direction.capture_label(), self.max_bytes);
        let capture = record.append(payload);
        self.observer.emit(Observation::Frame {
            exchange: self.exchange,
            direction,
            seq,
            summary,
            capture,
        });

        for outcome in outcomes {
            self.observer.emit(Observation::Ack {
                exchange: self.exchange,
                outcome,
            });
        }
    }

    /// Frames relayed so far as `(client→upstream, upstream→client)`.
    pub fn counts(&self) -> (u64, u64) {
        (self.client_seq, self.upstream_seq)
    }

    /// Report acknowledgements that never arrived and log the close.
    pub fn finish(self, reason: &str) {
        let pending = self.acks.pending();
        tracing::info!(
            exchange = %self.exchange,
            reason,
            client_frames = self.client_seq,
            upstream_frames = self.upstream_seq,
            pending_acks = pending,
            "Upgraded connection closed"
        );

        for outcome in self.acks.finish() {
            self.observer.emit(Observation::Ack {
                exchange: self.exchange,
                outcome,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    async fn wait_until(sink: &MemorySink, done: impl Fn(&[String]) -> bool) -> Vec<String> {
        for _ in 0..200 {
            let lines = sink.lines();
            if done(&lines) {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.lines()
    }

    fn count_prefix(lines: &[String], prefix: &str) -> usize {
        lines.iter().filter(|l| l.starts_with(prefix)).count()
    }

    #[test]
    fn detects_upgrade_tokens() {
        assert!(is_upgrade_request(&headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(is_upgrade_request(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "WebSocket"),
        ])));
        assert!(!is_upgrade_request(&headers(&[("upgrade", "websocket")])));
        assert!(!is_upgrade_request(&headers(&[
            ("connection", "upgrade"),
            ("upgrade", "h2c"),
        ])));
    }

    #[test]
    fn messages_convert_both_ways() {
        let out = to_upstream(Message::Text(String::from("42[\"hi\"]").into()));
        assert_eq!(out, UpstreamMessage::Text(String::from("42[\"hi\"]").into()));

        let back = to_client(UpstreamMessage::Close(Some(UpstreamCloseFrame {
            code: CloseCode::Normal,
            reason: String::from("bye").into(),
        })));
        match back {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn describes_close_and_binary() {
        let close = Message::Close(Some(CloseFrame {
            code: 1001,
            reason: String::from("going").into(),
        }));
        let (summary, payload) = describe_client(&close);
        assert_eq!(summary.to_string(), "websocket close 1001 \"going\"");
        assert_eq!(payload, b"going");

        let binary = UpstreamMessage::Binary(vec![1u8, 2, 3].into());
        let (summary, payload) = describe_upstream(&binary).unwrap();
        assert_eq!(summary, FrameSummary::Binary { len: 3 });
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[tokio::test]
    async fn frames_are_numbered_per_direction() {
        let sink = MemorySink::new();
        let observer = Observer::spawn(sink.clone(), 64);
        let exchange = ExchangeId::new();
        let mut log = FrameLog::new(exchange, observer, 1024);

        for text in ["2ping", "3ping", "5"] {
            let direction = if text.starts_with('3') {
                Direction::UpstreamToClient
            } else {
                Direction::ClientToUpstream
            };
            log.record(direction, FrameSummary::from_text(text), text.as_bytes());
        }
        assert_eq!(log.counts(), (2, 1));
        log.finish("test");

        let lines = wait_until(&sink, |l| count_prefix(l, "frame[") >= 3).await;
        let frames: Vec<&String> = lines.iter().filter(|l| l.starts_with("frame[")).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("frame[1] client->upstream"));
        assert!(frames[1].starts_with("frame[1] upstream->client"));
        assert!(frames[2].starts_with("frame[2] client->upstream"));
    }

    #[tokio::test]
    async fn ack_follows_its_frame() {
        let sink = MemorySink::new();
        let observer = Observer::spawn(sink.clone(), 64);
        let exchange = ExchangeId::new();
        let mut log = FrameLog::new(exchange, observer, 1024);

        let event = "427[\"ping\",1]";
        let ack = "437[\"pong\"]";
        log.record(
            Direction::ClientToUpstream,
            FrameSummary::from_text(event),
            event.as_bytes(),
        );
        log.record(
            Direction::UpstreamToClient,
            FrameSummary::from_text(ack),
            ack.as_bytes(),
        );
        log.finish("test");

        let lines = wait_until(&sink, |l| count_prefix(l, "[ACK]") >= 2).await;
        let ack_lines: Vec<&String> = lines.iter().filter(|l| l.starts_with("[ACK]")).collect();
        assert_eq!(ack_lines.len(), 2);
        let ack_pos = lines.iter().position(|l| l == ack_lines[1]).unwrap();
        let frame_pos = lines
            .iter()
            .position(|l| l.starts_with("frame[1] upstream->client"))
            .unwrap();
        assert!(frame_pos < ack_pos);
    }

    #[tokio::test]
    async fn unanswered_event_reported_on_finish() {
        let sink = MemorySink::new();
        let observer = Observer::spawn(sink.clone(), 64);
        let mut log = FrameLog::new(ExchangeId::new(), observer, 1024);

        let event = "429[\"lonely\"]";
        log.record(
            Direction::ClientToUpstream,
            FrameSummary::from_text(event),
            event.as_bytes(),
        );
        log.finish("test");

        let lines = wait_until(&sink, |l| {
            l.iter().any(|line| line.contains("never acknowledged"))
        })
        .await;
        let last = lines.last().unwrap();
        assert!(last.starts_with("[ACK]"), "got {:?}", lines);
    }

    #[tokio::test]
    async fn evicted_callback_reported_before_new_one() {
        let sink = MemorySink::new();
        let observer = Observer::spawn(sink.clone(), 64);
        let mut log = FrameLog::new(ExchangeId::new(), observer, 1024).with_ack_limit(1);

        for event in ["421[\"a\"]", "422[\"b\"]"] {
            log.record(
                Direction::ClientToUpstream,
                FrameSummary::from_text(event),
                event.as_bytes(),
            );
        }

        let lines = wait_until(&sink, |l| count_prefix(l, "[ACK]") >= 3).await;
        let acks: Vec<&String> = lines.iter().filter(|l| l.starts_with("[ACK]")).collect();
        assert!(acks[0].contains("callback 1") && acks[0].ends_with("awaiting reply"));
        assert!(acks[1].contains("callback 1") && acks[1].ends_with("never acknowledged"));
        assert!(acks[2].contains("callback 2") && acks[2].ends_with("awaiting reply"));
    }

    #[test]
    fn disabled_observer_still_counts() {
        let mut log = FrameLog::new(ExchangeId::new(), Observer::disabled(), 16);
        log.record(Direction::ClientToUpstream, FrameSummary::Ping, b"");
        log.record(Direction::UpstreamToClient, FrameSummary::Pong, b"");
        assert_eq!(log.counts(), (1, 1));
    }
}
