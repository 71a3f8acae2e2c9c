//! Long-polling payloads.
//!
//! Without an upgrade, engine packets travel in ordinary HTTP bodies: the
//! client uploads with `POST` and collects with `GET`. One body can hold
//! several packets, framed one of three ways:
//!
//! ```text
//! binary   0x00 <len digits as bytes 0-9> 0xFF <len bytes of text>   (0x01: raw bytes)
//! text     <len>:<packet><len>:<packet>...
//! record   <packet> 0x1E <packet> 0x1E ...
//! ```
//!
//! A session spans many exchanges, so callback bookkeeping is kept per
//! session id rather than per connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::protocol::ack::{AckOutcome, AckTracker};
use crate::protocol::frame::{Frame, FrameError};
use crate::protocol::{Direction, FrameSummary};

/// Sessions remembered at once before the least recently opened is dropped.
pub const DEFAULT_SESSION_LIMIT: usize = 1024;

const RECORD_SEPARATOR: u8 = 0x1e;

/// Split a polling body into the packets it carries.
pub fn decode_payload(body: &[u8]) -> Result<Vec<FrameSummary>, FrameError> {
    match body.first() {
        None => Ok(Vec::new()),
        Some(0x00 | 0x01) => decode_binary(body),
        Some(_) => {
            let text = String::from_utf8_lossy(body);
            if has_length_prefix(&text) {
                decode_counted(&text)
            } else {
                Ok(text
                    .split(RECORD_SEPARATOR as char)
                    .map(FrameSummary::from_text)
                    .collect())
            }
        }
    }
}

fn has_length_prefix(text: &str) -> bool {
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && text.as_bytes().get(digits) == Some(&b':')
}

/// `<len>:<packet>` repeated; lengths count characters.
fn decode_counted(mut text: &str) -> Result<Vec<FrameSummary>, FrameError> {
    let mut packets = Vec::new();
    while !text.is_empty() {
        let (len, rest) = text.split_once(':').ok_or(FrameError::PayloadLength)?;
        let len: usize = len.parse().map_err(|_| FrameError::PayloadLength)?;
        let end = match rest.char_indices().nth(len) {
            Some((end, _)) => end,
            None if rest.chars().count() == len => rest.len(),
            None => return Err(FrameError::TruncatedPayload),
        };
        packets.push(FrameSummary::from_text(&rest[..end]));
        text = &rest[end..];
    }
    Ok(packets)
}

/// Type byte, decimal digits stored as raw byte values, `0xFF`, then the
/// packet; lengths count bytes.
fn decode_binary(mut body: &[u8]) -> Result<Vec<FrameSummary>, FrameError> {
    let mut packets = Vec::new();
    while let Some((&kind, rest)) = body.split_first() {
        let digits = rest
            .iter()
            .position(|&b| b == 0xff)
            .ok_or(FrameError::PayloadLength)?;
        let mut len = 0usize;
        for &digit in &rest[..digits] {
            if digit > 9 {
                return Err(FrameError::PayloadLength);
            }
            len = len
                .checked_mul(10)
                .and_then(|n| n.checked_add(usize::from(digit)))
                .ok_or(FrameError::PayloadLength)?;
        }
        let rest = &rest[digits + 1..];
        if rest.len() < len {
            return Err(FrameError::TruncatedPayload);
        }
        let (packet, tail) = rest.split_at(len);
        packets.push(match kind {
            0x00 => FrameSummary::from_text(&String::from_utf8_lossy(packet)),
            _ => FrameSummary::Binary { len },
        });
        body = tail;
    }
    Ok(packets)
}

/// Session id announced by an open packet.
pub fn announced_sid(summary: &FrameSummary) -> Option<String> {
    let FrameSummary::Packet(Frame::Open(payload)) = summary else {
        return None;
    };
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get("sid")?.as_str().map(str::to_owned)
}

struct Session {
    tracker: AckTracker,
    opened: u64,
}

struct SessionTable {
    sessions: HashMap<String, Session>,
    opened: u64,
    max_sessions: usize,
    max_pending: usize,
}

impl SessionTable {
    fn session(&mut self, sid: &str) -> &mut AckTracker {
        if !self.sessions.contains_key(sid) {
            self.evict_for_new();
        }
        let opened = &mut self.opened;
        let max_pending = self.max_pending;
        &mut self
            .sessions
            .entry(sid.to_string())
            .or_insert_with(|| {
                *opened += 1;
                Session {
                    tracker: AckTracker::with_limit(max_pending),
                    opened: *opened,
                }
            })
            .tracker
    }

    fn evict_for_new(&mut self) {
        while self.sessions.len() >= self.max_sessions {
            let Some(oldest) = self
                .sessions
                .iter()
                .min_by_key(|(_, session)| session.opened)
                .map(|(sid, _)| sid.clone())
            else {
                return;
            };
            if let Some(session) = self.sessions.remove(&oldest) {
                tracing::debug!(
                    sid = %oldest,
                    pending_acks = session.tracker.pending(),
                    "Polling session forgotten"
                );
            }
        }
    }
}

/// Callback bookkeeping shared by every polling exchange of the process.
///
/// The lock is only held while one payload is accounted for.
#[derive(Clone)]
pub struct PollingSessions {
    table: Arc<Mutex<SessionTable>>,
}

impl Default for PollingSessions {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_LIMIT, crate::protocol::ack::DEFAULT_PENDING_LIMIT)
    }
}

impl PollingSessions {
    pub fn new(max_sessions: usize, max_pending: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(SessionTable {
                sessions: HashMap::new(),
                opened: 0,
                max_sessions: max_sessions.max(1),
                max_pending,
            })),
        }
    }

    /// Sessions currently tracked.
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for the packets of one payload travelling in `direction`.
    ///
    /// Returns the ack outcomes of each packet, index for index. Without a
    /// `sid` the session is taken from an open packet in the payload; if
    /// there is none the payload is accounted for on its own. A close
    /// packet ends the session and reports what it left unanswered.
    pub fn track(
        &self,
        sid: Option<&str>,
        direction: Direction,
        packets: &[FrameSummary],
    ) -> Vec<Vec<AckOutcome>> {
        let sid = sid
            .map(str::to_owned)
            .or_else(|| packets.iter().find_map(announced_sid));

        let Some(sid) = sid else {
            let mut tracker = AckTracker::new();
            return packets
                .iter()
                .map(|summary| {
                    summary
                        .packet()
                        .map(|packet| tracker.observe(direction, packet))
                        .unwrap_or_default()
                })
                .collect();
        };

        let mut table = self.lock();
        let mut outcomes = Vec::with_capacity(packets.len());
        for summary in packets {
            if matches!(summary, FrameSummary::Packet(Frame::Close)) {
                let left = table
                    .sessions
                    .remove(&sid)
                    .map(|session| session.tracker.finish())
                    .unwrap_or_default();
                outcomes.push(left);
                continue;
            }
            let tracker = table.session(&sid);
            outcomes.push(match summary.packet() {
                Some(packet) => tracker.observe(direction, packet),
                None => Vec::new(),
            });
        }
        outcomes
    }
}
