//! Capture records and their text rendering.
//!
//! A [`CaptureRecord`] is the logging side-channel copy of the bytes that
//! cross one side of an exchange. It never touches the forwarded bytes:
//! callers pass a borrowed view of each chunk and keep forwarding the
//! original.

use std::fmt;

/// What a capture record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureLabel {
    RequestBody,
    ResponseBody,
    ClientFrame,
    UpstreamFrame,
}

impl CaptureLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureLabel::RequestBody => "REQUEST.BODY",
            CaptureLabel::ResponseBody => "RESPONSE.BODY",
            CaptureLabel::ClientFrame => "CLIENT.FRAME",
            CaptureLabel::UpstreamFrame => "UPSTREAM.FRAME",
        }
    }
}

impl fmt::Display for CaptureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort text form of some captured bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedCapture {
    text: String,
    omitted: usize,
}

impl RenderedCapture {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            omitted: 0,
        }
    }

    /// Text form of the captured bytes.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bytes that were seen but fell past the capture cap.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }

    /// `(index, character, code point)` for every character of the text.
    pub fn characters(&self) -> impl Iterator<Item = (usize, char, u32)> + '_ {
        self.text.chars().enumerate().map(|(i, c)| (i, c, c as u32))
    }
}

/// Incremental UTF-8 decoder that never fails.
///
/// Invalid sequences become U+FFFD. A sequence cut by a chunk boundary is
/// held back and completed by the next chunk.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let joined;
        let mut rest: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut bytes = std::mem::take(&mut self.pending);
            bytes.extend_from_slice(chunk);
            joined = bytes;
            &joined
        };

        let mut out = String::with_capacity(rest.len());
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush a dangling partial sequence.
    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Append-only, size-bounded copy of one side of an exchange.
#[derive(Debug)]
pub struct CaptureRecord {
    label: CaptureLabel,
    max_bytes: usize,
    retained: Vec<u8>,
    seen: usize,
    carry: Utf8Carry,
}

impl CaptureRecord {
    pub fn new(label: CaptureLabel, max_bytes: usize) -> Self {
        Self {
            label,
            max_bytes,
            retained: Vec::new(),
            seen: 0,
            carry: Utf8Carry::default(),
        }
    }

    pub fn label(&self) -> CaptureLabel {
        self.label
    }

    /// Total bytes seen, including those past the cap.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Bytes captured so far (never more than the cap).
    pub fn bytes(&self) -> &[u8] {
        &self.retained
    }

    /// Retain a chunk without rendering it. Returns the slice that fit
    /// under the cap.
    pub fn push<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let room = self.max_bytes.saturating_sub(self.retained.len());
        let kept = &chunk[..chunk.len().min(room)];
        self.retained.extend_from_slice(kept);
        self.seen += chunk.len();
        kept
    }

    /// Retain a chunk and render it.
    pub fn append(&mut self, chunk: &[u8]) -> RenderedCapture {
        let kept = self.push(chunk);
        let mut text = self.carry.decode(kept);
        let omitted = chunk.len() - kept.len();
        if omitted > 0 {
            text.push_str(&self.carry.finish());
        }
        RenderedCapture { text, omitted }
    }

    /// Render everything captured so far as one unit.
    pub fn finish(&self) -> RenderedCapture {
        RenderedCapture {
            text: String::from_utf8_lossy(&self.retained).into_owned(),
            omitted: self.seen - self.retained.len(),
        }
    }
}
