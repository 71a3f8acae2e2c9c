//! Observer: renders captures off the forwarding path.
//!
//! # Responsibilities
//! - Accept observations from any exchange without blocking it
//! - Render each observation into log lines on a background task
//! - Degrade by dropping (and counting) when the sink falls behind
//!
//! # Design Decisions
//! - Bounded mpsc queue with `try_send`; a full queue drops, never waits
//! - One queue for all exchanges keeps per-exchange emission order
//! - Lines are tagged with their exchange so interleaved output can be
//!   separated again

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::StatusCode;
use tokio::sync::mpsc;

use crate::capture::{CaptureLabel, HeaderBlock, RenderedCapture};
use crate::net::ExchangeId;
use crate::protocol::{AckOutcome, Direction, FrameSummary};

/// Which half of an exchange a header block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Request,
    Response,
}

impl Side {
    fn prefix(&self) -> &'static str {
        match self {
            Side::Request => "REQUEST",
            Side::Response => "RESPONSE",
        }
    }
}

/// One thing worth reporting about an exchange.
#[derive(Debug, Clone)]
pub enum Observation {
    Request {
        exchange: ExchangeId,
        method: String,
        uri: String,
    },
    Headers {
        exchange: ExchangeId,
        side: Side,
        block: HeaderBlock,
    },
    Status {
        exchange: ExchangeId,
        status: StatusCode,
    },
    Body {
        exchange: ExchangeId,
        label: CaptureLabel,
        capture: RenderedCapture,
    },
    Frame {
        exchange: ExchangeId,
        direction: Direction,
        seq: u64,
        summary: FrameSummary,
        capture: RenderedCapture,
    },
    /// One engine packet out of a long-polling body; the body itself is
    /// reported separately.
    Polled {
        exchange: ExchangeId,
        direction: Direction,
        seq: u64,
        summary: FrameSummary,
    },
    Ack {
        exchange: ExchangeId,
        outcome: AckOutcome,
    },
    Failure {
        exchange: ExchangeId,
        reason: String,
    },
}

impl Observation {
    pub fn exchange(&self) -> ExchangeId {
        match self {
            Observation::Request { exchange, .. }
            | Observation::Headers { exchange, .. }
            | Observation::Status { exchange, .. }
            | Observation::Body { exchange, .. }
            | Observation::Frame { exchange, .. }
            | Observation::Polled { exchange, .. }
            | Observation::Ack { exchange, .. }
            | Observation::Failure { exchange, .. } => *exchange,
        }
    }

    /// Render as log lines.
    pub fn lines(&self) -> Vec<String> {
        match self {
            Observation::Request { method, uri, .. } => {
                vec![format!("[REQUEST.{}] {}", method, uri)]
            }
            Observation::Headers { side, block, .. } => {
                vec![format!("[{}.HEADERS] {}", side.prefix(), block.render())]
            }
            Observation::Status { status, .. } => vec![format!("[RESPONSE.STATUS] {}", status)],
            Observation::Body { label, capture, .. } => {
                let mut lines = vec![format!("[{}] {}", label, capture.text())];
                push_characters(&mut lines, capture);
                lines
            }
            Observation::Frame {
                direction,
                seq,
                summary,
                capture,
                ..
            } => {
                let mut lines = vec![
                    format!("[{}] {}", direction.capture_label(), capture.text()),
                    format!("frame[{}] {} {}", seq, direction, summary),
                ];
                push_characters(&mut lines, capture);
                lines
            }
            Observation::Polled {
                direction,
                seq,
                summary,
                ..
            } => vec![format!("packet[{}] {} {}", seq, direction, summary)],
            Observation::Ack { outcome, .. } => vec![render_ack(outcome)],
            Observation::Failure { reason, .. } => vec![format!("[PROXY.ERROR] {}", reason)],
        }
    }
}

fn push_characters(lines: &mut Vec<String>, capture: &RenderedCapture) {
    lines.extend(capture.characters().map(|(i, c, code)| {
        if c.is_control() {
            format!("body[{}] = {} = {}", i, c.escape_debug(), code)
        } else {
            format!("body[{}] = {} = {}", i, c, code)
        }
    }));
    if capture.is_truncated() {
        lines.push(format!("... {} more bytes not captured", capture.omitted()));
    }
}

fn event_label(event: &Option<String>) -> String {
    match event {
        Some(name) => format!("{:?}", name),
        None => "-".to_string(),
    }
}

fn render_ack(outcome: &AckOutcome) -> String {
    match outcome {
        AckOutcome::Requested {
            origin,
            namespace,
            id,
            event,
        } => format!(
            "[ACK] {} callback {} ({}, ns {}) awaiting reply",
            origin.sender(),
            id,
            event_label(event),
            namespace
        ),
        AckOutcome::Acknowledged {
            origin,
            namespace,
            id,
            event,
            elapsed,
        } => format!(
            "[ACK] {} acknowledged {} callback {} ({}, ns {}) after {}ms",
            origin.reverse().sender(),
            origin.sender(),
            id,
            event_label(event),
            namespace,
            elapsed.as_millis()
        ),
        AckOutcome::Unmatched { from, namespace, id } => format!(
            "[ACK] {} sent ack {} (ns {}) with no pending callback",
            from.sender(),
            id,
            namespace
        ),
        AckOutcome::Unacknowledged {
            origin,
            namespace,
            id,
            event,
        } => format!(
            "[ACK] {} callback {} ({}, ns {}) never acknowledged",
            origin.sender(),
            id,
            event_label(event),
            namespace
        ),
    }
}

/// Destination for rendered lines.
pub trait LineSink: Send + 'static {
    fn write_line(&mut self, exchange: ExchangeId, line: &str);
}

/// Writes each line as a `tracing` event with target `capture`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn write_line(&mut self, exchange: ExchangeId, line: &str) {
        tracing::info!(target: "capture", exchange = %exchange, "{}", line);
    }
}

/// Keeps lines in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<(ExchangeId, String)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line written so far, with its exchange.
    pub fn entries(&self) -> Vec<(ExchangeId, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every line written so far.
    pub fn lines(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, line)| line).collect()
    }

    /// Lines written for one exchange.
    pub fn lines_for(&self, exchange: ExchangeId) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(id, _)| *id == exchange)
            .map(|(_, line)| line)
            .collect()
    }
}

impl LineSink for MemorySink {
    fn write_line(&mut self, exchange: ExchangeId, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((exchange, line.to_string()));
    }
}

struct ObserverInner {
    tx: mpsc::Sender<Observation>,
    dropped: AtomicU64,
}

/// Cheap, cloneable handle used by the forwarding path.
#[derive(Clone, Default)]
pub struct Observer {
    inner: Option<Arc<ObserverInner>>,
}

impl Observer {
    /// Start the rendering task. Must be called inside a Tokio runtime.
    pub fn spawn<S: LineSink>(sink: S, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(render_loop(rx, sink));
        Self {
            inner: Some(Arc::new(ObserverInner {
                tx,
                dropped: AtomicU64::new(0),
            })),
        }
    }

    /// An observer that discards everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Queue an observation. Never waits.
    pub fn emit(&self, observation: Observation) {
        let Some(inner) = &self.inner else {
            return;
        };
        match inner.tx.try_send(observation) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "Observer queue full, dropping observations");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Observer task gone, observation discarded");
            }
        }
    }

    /// Observations dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|inner| inner.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("enabled", &self.is_enabled())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn render_loop<S: LineSink>(mut rx: mpsc::Receiver<Observation>, mut sink: S) {
    while let Some(observation) = rx.recv().await {
        let exchange = observation.exchange();
        for line in observation.lines() {
            sink.write_line(exchange, &line);
        }
    }
}
