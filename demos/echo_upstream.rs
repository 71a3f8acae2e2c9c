//! Local upstream for trying the proxy by hand.
//!
//! Run it, then start the proxy with its defaults:
//!
//! ```text
//! cargo run --example echo_upstream
//! cargo run -- --port 8000 --upstream-port 9000
//! ```
//!
//! `POST /echo` returns the request body. Any WebSocket path speaks
//! enough of the event-stream protocol to exercise events, namespaces and
//! acknowledgements in both directions.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
    Router,
};
use observing_proxy::protocol::{Frame, Packet, PacketKind};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echo_upstream=info".into()),
        )
        .init();

    let app = Router::new()
        .route("/", get(|| async { "Hello from the echo upstream" }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .fallback(upgrade);

    let addr = SocketAddr::from(([127, 0, 0, 1], 9000));
    tracing::info!(address = %addr, "Echo upstream listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(session)
}

/// Callbacks this server asked the client to answer: id → event name.
struct Session {
    next_id: u64,
    waiting: HashMap<u64, String>,
}

async fn session(mut socket: WebSocket) {
    let open = Frame::Open(
        json!({"sid": "echo", "upgrades": [], "pingInterval": 25000, "pingTimeout": 60000})
            .to_string(),
    );
    let connect = Frame::Message(Packet::new(PacketKind::Connect));
    for frame in [open, connect] {
        if socket.send(Message::Text(frame.encode().into())).await.is_err() {
            return;
        }
    }

    let mut state = Session {
        next_id: 0,
        waiting: HashMap::new(),
    };

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let replies = match Frame::decode(text.as_str()) {
            Ok(frame) => respond(&mut state, frame),
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable frame");
                continue;
            }
        };
        for reply in replies {
            if socket.send(Message::Text(reply.encode().into())).await.is_err() {
                return;
            }
        }
    }
    tracing::info!("Session closed");
}

fn emit(namespace: &str, name: &str, args: Vec<Value>) -> Frame {
    Frame::Message(Packet::event(name, args).with_namespace(namespace))
}

fn respond(state: &mut Session, frame: Frame) -> Vec<Frame> {
    let packet = match frame {
        Frame::Ping(payload) => return vec![Frame::Pong(payload)],
        Frame::Message(packet) => packet,
        _ => return Vec::new(),
    };
    let ns = packet.namespace.clone();

    match packet.kind {
        PacketKind::Connect => {
            return vec![Frame::Message(
                Packet::new(PacketKind::Connect).with_namespace(&ns),
            )]
        }
        PacketKind::Ack => {
            let Some(event) = packet.ack_id.and_then(|id| state.waiting.remove(&id)) else {
                return Vec::new();
            };
            tracing::info!(event = %event, "Client answered callback");
            return vec![emit(&ns, "ack_callback_response", packet.args().to_vec())];
        }
        _ if !packet.kind.is_event() => return Vec::new(),
        _ => {}
    }

    let args = packet.args().to_vec();
    let payload = json!({"xxx": "yyy"});

    if let Some(id) = packet.ack_id {
        let reply = match packet.event_name() {
            Some("emit_with_callback_with_payload") => vec![payload],
            Some("emit_with_callback_with_multiple_payloads") => vec![payload.clone(), payload],
            Some("emit_with_callback") => Vec::new(),
            _ => args,
        };
        return vec![Frame::Message(Packet::ack(id, reply).with_namespace(&ns))];
    }

    match packet.event_name() {
        Some("emit") => vec![emit(&ns, "emit_response", Vec::new())],
        Some("aaa") => vec![emit(&ns, "aaa_response", vec![payload])],
        Some("ack") => {
            state.next_id += 1;
            state.waiting.insert(state.next_id, "ack_response".into());
            vec![Frame::Message(
                Packet::event("ack_response", args)
                    .with_namespace(&ns)
                    .with_ack_id(state.next_id),
            )]
        }
        Some(name) => vec![emit(&ns, &format!("{}_response", name), args)],
        None => Vec::new(),
    }
}
