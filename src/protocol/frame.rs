//! Event-stream frame codec.
//!
//! Text frames on an upgraded connection carry an engine packet: one
//! type digit followed by its payload. Message packets nest a second
//! layer:
//!
//! ```text
//! <engine type> [<packet type>] [<attachments>-] [/<namespace>,] [<ack id>] [<json>]
//!       4              2                            /chat,          12      ["say","hi"]
//! ```
//!
//! Both layers decode into closed enums so the relay handles each kind
//! with its own match arm.

use std::fmt;

use serde_json::Value;

/// Namespace used when a packet names none.
pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine packet type '{0}'")]
    UnknownEngineType(char),
    #[error("unknown message packet type '{0}'")]
    UnknownPacketType(char),
    #[error("message packet has no type")]
    MissingPacketType,
    #[error("attachment count is not terminated by '-'")]
    UnterminatedAttachments,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("payload is not JSON: {0}")]
    Payload(String),
    #[error("polling payload has a malformed length prefix")]
    PayloadLength,
    #[error("polling payload ends inside a packet")]
    TruncatedPayload,
}

/// Engine-level packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake; payload is the session description JSON.
    Open(String),
    Close,
    Ping(String),
    Pong(String),
    Message(Packet),
    Upgrade(String),
    Noop,
}

/// Message-level packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    fn from_digit(c: char) -> Result<Self, FrameError> {
        Ok(match c {
            '0' => PacketKind::Connect,
            '1' => PacketKind::Disconnect,
            '2' => PacketKind::Event,
            '3' => PacketKind::Ack,
            '4' => PacketKind::Error,
            '5' => PacketKind::BinaryEvent,
            '6' => PacketKind::BinaryAck,
            other => return Err(FrameError::UnknownPacketType(other)),
        })
    }

    fn digit(&self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::Error => '4',
            PacketKind::BinaryEvent => '5',
            PacketKind::BinaryAck => '6',
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, PacketKind::BinaryEvent | PacketKind::BinaryAck)
    }

    pub fn is_event(&self) -> bool {
        matches!(self, PacketKind::Event | PacketKind::BinaryEvent)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, PacketKind::Ack | PacketKind::BinaryAck)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Connect => "connect",
            PacketKind::Disconnect => "disconnect",
            PacketKind::Event => "event",
            PacketKind::Ack => "ack",
            PacketKind::Error => "error",
            PacketKind::BinaryEvent => "binary-event",
            PacketKind::BinaryAck => "binary-ack",
        }
    }
}

/// Message packet: event name and arguments, an optional callback id.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub attachments: Option<u32>,
    pub data: Option<Value>,
}

impl Packet {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            attachments: None,
            data: None,
        }
    }

    /// An event packet: `[name, args...]`.
    pub fn event(name: &str, args: Vec<Value>) -> Self {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Value::String(name.to_string()));
        items.extend(args);
        Self {
            data: Some(Value::Array(items)),
            ..Self::new(PacketKind::Event)
        }
    }

    /// An ack packet answering `id`.
    pub fn ack(id: u64, args: Vec<Value>) -> Self {
        Self {
            ack_id: Some(id),
            data: Some(Value::Array(args)),
            ..Self::new(PacketKind::Ack)
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_ack_id(mut self, id: u64) -> Self {
        self.ack_id = Some(id);
        self
    }

    /// Event name for event packets.
    pub fn event_name(&self) -> Option<&str> {
        if !self.kind.is_event() {
            return None;
        }
        self.data.as_ref()?.as_array()?.first()?.as_str()
    }

    /// Event arguments (everything after the name) or ack arguments.
    pub fn args(&self) -> &[Value] {
        let items = match self.data.as_ref().and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => return &[],
        };
        if self.kind.is_event() && !items.is_empty() {
            &items[1..]
        } else {
            items
        }
    }

    fn decode(body: &str) -> Result<Self, FrameError> {
        let kind = match body.chars().next() {
            Some(c) => PacketKind::from_digit(c)?,
            None => return Err(FrameError::MissingPacketType),
        };
        // The type digit is ASCII, so slicing past it is safe.
        let mut rest = &body[1..];

        let mut attachments = None;
        if kind.is_binary() {
            let dash = rest.find('-').ok_or(FrameError::UnterminatedAttachments)?;
            attachments = Some(parse_number::<u32>(&rest[..dash])?);
            rest = &rest[dash + 1..];
        }

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    namespace = rest[..comma].to_string();
                    rest = &rest[comma + 1..];
                }
                None => {
                    namespace = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            Some(parse_number::<u64>(&rest[..digits])?)
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest).map_err(|e| FrameError::Payload(e.to_string()))?)
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            attachments,
            data,
        })
    }

    fn encode_into(&self, out: &mut String) {
        out.push(self.kind.digit());
        if let Some(n) = self.attachments {
            out.push_str(&n.to_string());
            out.push('-');
        }
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
    }
}

fn parse_number<T: std::str::FromStr>(digits: &str) -> Result<T, FrameError> {
    digits
        .parse()
        .map_err(|_| FrameError::InvalidNumber(digits.to_string()))
}

impl Frame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(FrameError::Empty)?;
        let payload = chars.as_str();
        Ok(match kind {
            '0' => Frame::Open(payload.to_string()),
            '1' => Frame::Close,
            '2' => Frame::Ping(payload.to_string()),
            '3' => Frame::Pong(payload.to_string()),
            '4' => Frame::Message(Packet::decode(payload)?),
            '5' => Frame::Upgrade(payload.to_string()),
            '6' => Frame::Noop,
            other => return Err(FrameError::UnknownEngineType(other)),
        })
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            Frame::Open(payload) => {
                out.push('0');
                out.push_str(payload);
            }
            Frame::Close => out.push('1'),
            Frame::Ping(payload) => {
                out.push('2');
                out.push_str(payload);
            }
            Frame::Pong(payload) => {
                out.push('3');
                out.push_str(payload);
            }
            Frame::Message(packet) => {
                out.push('4');
                packet.encode_into(&mut out);
            }
            Frame::Upgrade(payload) => {
                out.push('5');
                out.push_str(payload);
            }
            Frame::Noop => out.push('6'),
        }
        out
    }
}

/// One-line human summary, used in observation output.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Open(payload) => write!(f, "open {}", payload),
            Frame::Close => f.write_str("close"),
            Frame::Ping(payload) if payload.is_empty() => f.write_str("ping"),
            Frame::Ping(payload) => write!(f, "ping {}", payload),
            Frame::Pong(payload) if payload.is_empty() => f.write_str("pong"),
            Frame::Pong(payload) => write!(f, "pong {}", payload),
            Frame::Upgrade(_) => f.write_str("upgrade"),
            Frame::Noop => f.write_str("noop"),
            Frame::Message(packet) => {
                f.write_str(packet.kind.as_str())?;
                if let Some(name) = packet.event_name() {
                    write!(f, " {:?}", name)?;
                }
                write!(f, " ns={}", packet.namespace)?;
                if let Some(id) = packet.ack_id {
                    write!(f, " ack={}", id)?;
                }
                if let Some(n) = packet.attachments {
                    write!(f, " attachments={}", n)?;
                }
                let args = packet.args();
                if !args.is_empty() {
                    write!(f, " args={}", args.len())?;
                }
                Ok(())
            }
        }
    }
}
