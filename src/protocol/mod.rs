//! Event-stream protocol carried over upgraded connections and polling bodies.
//!
//! # Data Flow
//! ```text
//! WebSocket message (text), or long-polling body → polling.rs (split)
//!     → frame.rs (engine packet → message packet)
//!     → ack.rs (callback id correlation)
//!     → FrameSummary (what the observer prints)
//! ```
//!
//! Decoding is for observation only. The relay forwards the original
//! message whether or not it decodes.

pub mod ack;
pub mod frame;
pub mod polling;

use std::fmt;

pub use ack::{AckOutcome, AckTracker};
pub use polling::PollingSessions;
pub use frame::{Frame, FrameError, Packet, PacketKind, DEFAULT_NAMESPACE};

use crate::capture::CaptureLabel;

/// Which way a frame travels on an upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToUpstream => Direction::UpstreamToClient,
            Direction::UpstreamToClient => Direction::ClientToUpstream,
        }
    }

    /// The peer the frame came from.
    pub fn sender(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client",
            Direction::UpstreamToClient => "upstream",
        }
    }

    pub fn capture_label(self) -> CaptureLabel {
        match self {
            Direction::ClientToUpstream => CaptureLabel::ClientFrame,
            Direction::UpstreamToClient => CaptureLabel::UpstreamFrame,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client->upstream"),
            Direction::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// What the relay understood of one WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSummary {
    Packet(Frame),
    Undecoded(FrameError),
    Binary { len: usize },
    Ping,
    Pong,
    Close { code: Option<u16>, reason: String },
}

impl FrameSummary {
    /// Decode a text message for display.
    pub fn from_text(text: &str) -> Self {
        match Frame::decode(text) {
            Ok(frame) => FrameSummary::Packet(frame),
            Err(e) => FrameSummary::Undecoded(e),
        }
    }

    pub fn packet(&self) -> Option<&Packet> {
        match self {
            FrameSummary::Packet(Frame::Message(packet)) => Some(packet),
            _ => None,
        }
    }
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSummary::Packet(frame) => write!(f, "{}", frame),
            FrameSummary::Undecoded(e) => write!(f, "opaque text ({})", e),
            FrameSummary::Binary { len } => write!(f, "binary {} bytes", len),
            FrameSummary::Ping => f.write_str("websocket ping"),
            FrameSummary::Pong => f.write_str("websocket pong"),
            FrameSummary::Close { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "websocket close {} {:?}", code, reason)
            }
            FrameSummary::Close { code: Some(code), .. } => write!(f, "websocket close {}", code),
            FrameSummary::Close { code: None, .. } => f.write_str("websocket close"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_reverses() {
        assert_eq!(Direction::ClientToUpstream.reverse(), Direction::UpstreamToClient);
        assert_eq!(Direction::UpstreamToClient.sender(), "upstream");
        assert_eq!(
            Direction::ClientToUpstream.capture_label(),
            CaptureLabel::ClientFrame
        );
    }

    #[test]
    fn summary_keeps_undecodable_text() {
        let summary = FrameSummary::from_text("hello");
        assert!(matches!(summary, FrameSummary::Undecoded(_)));
        assert_eq!(summary.to_string(), "opaque text (unknown engine packet type 'h')");
        assert!(summary.packet().is_none());
    }

    #[test]
    fn summary_exposes_message_packets() {
        let summary = FrameSummary::from_text(r#"42["emit"]"#);
        assert_eq!(summary.packet().and_then(Packet::event_name), Some("emit"));
    }
}
