//! Observed body decorator.
//!
//! [`ObservedBody`] wraps any body and is itself a body. Every data frame
//! is shown to a [`CaptureRecord`] and then handed on untouched, so the
//! wrapped body can stand in wherever the original was sent. Trailers,
//! size hints and end-of-stream pass straight through, which keeps hyper's
//! framing choice (content-length or chunked) unchanged.
//!
//! # States
//! ```text
//! AwaitingHeaders --HeadersParsed--> StreamingBody --End--> Complete
//!        |                               |
//!        +------------Error--------------+-----Error----> Failed
//! ```
//! Terminal states absorb every later event.

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use hyper::body::{Body, Bytes, Frame, SizeHint};

use crate::capture::record::{CaptureLabel, CaptureRecord};
use crate::net::ExchangeId;
use crate::observability::{Observation, Observer};

/// Lifecycle of one side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    AwaitingHeaders,
    StreamingBody,
    Complete,
    Failed,
}

/// Read events that drive [`ExchangeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    HeadersParsed,
    Chunk,
    End,
    Error,
}

impl ExchangeState {
    pub fn on(self, event: ReadEvent) -> Self {
        use ExchangeState::*;
        match (self, event) {
            (Complete | Failed, _) => self,
            (_, ReadEvent::Error) => Failed,
            (AwaitingHeaders, ReadEvent::HeadersParsed) => StreamingBody,
            (AwaitingHeaders, _) => Failed,
            (StreamingBody, ReadEvent::End) => Complete,
            (StreamingBody, _) => StreamingBody,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Complete | ExchangeState::Failed)
    }
}

/// When captured bytes reach the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitPolicy {
    /// Render and emit every chunk as it passes.
    EachChunk,
    /// Accumulate, emit the whole record at end of body.
    OnEnd,
}

/// Called once with the captured bytes when a body completes untruncated.
pub type Inspector = Box<dyn FnOnce(&[u8]) + Send>;

/// A body that reports its bytes to an [`Observer`] as they stream by.
pub struct ObservedBody<B: Body> {
    inner: B,
    record: CaptureRecord,
    policy: EmitPolicy,
    observer: Observer,
    exchange: ExchangeId,
    state: ExchangeState,
    truncation_reported: bool,
    inspect: Option<Inspector>,
}

impl<B: Body> ObservedBody<B> {
    /// Wrap a body whose headers have already been parsed.
    pub fn new(
        inner: B,
        record: CaptureRecord,
        policy: EmitPolicy,
        observer: Observer,
        exchange: ExchangeId,
    ) -> Self {
        Self {
            inner,
            record,
            policy,
            observer,
            exchange,
            state: ExchangeState::AwaitingHeaders.on(ReadEvent::HeadersParsed),
            truncation_reported: false,
            inspect: None,
        }
    }

    /// Hand the complete capture to `inspect` at end of stream. Skipped
    /// when the body fails or outgrows the capture cap.
    pub fn with_inspector(mut self, inspect: impl FnOnce(&[u8]) + Send + 'static) -> Self {
        self.inspect = Some(Box::new(inspect));
        self
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    fn on_chunk(&mut self, data: &Bytes) {
        self.state = self.state.on(ReadEvent::Chunk);
        if data.is_empty() {
            return;
        }
        match self.policy {
            EmitPolicy::OnEnd => {
                self.record.push(data);
            }
            EmitPolicy::EachChunk => {
                let capture = self.record.append(data);
                if capture.text().is_empty() && (capture.omitted() == 0 || self.truncation_reported) {
                    return;
                }
                self.truncation_reported |= capture.is_truncated();
                self.observer.emit(Observation::Body {
                    exchange: self.exchange,
                    label: self.record.label(),
                    capture,
                });
            }
        }
    }

    fn on_end(&mut self) {
        if self.state != ExchangeState::StreamingBody {
            return;
        }
        self.state = self.state.on(ReadEvent::End);
        if self.policy == EmitPolicy::OnEnd {
            self.observer.emit(Observation::Body {
                exchange: self.exchange,
                label: self.record.label(),
                capture: self.record.finish(),
            });
        }
        tracing::debug!(
            exchange = %self.exchange,
            label = %self.record.label(),
            bytes = self.record.seen(),
            "Body complete"
        );
        if let Some(inspect) = self.inspect.take() {
            if self.record.seen() == self.record.bytes().len() {
                inspect(self.record.bytes());
            }
        }
    }

    fn on_error(&mut self, err: &dyn fmt::Display) {
        if self.state.is_terminal() {
            return;
        }
        self.state = self.state.on(ReadEvent::Error);
        tracing::warn!(
            exchange = %self.exchange,
            label = %self.record.label(),
            error = %err,
            "Body stream failed"
        );
        self.observer.emit(Observation::Failure {
            exchange: self.exchange,
            reason: format!("{} stream failed: {}", self.record.label(), err),
        });
    }

    /// A body may report end-of-stream without yielding a final `None`.
    fn settle(&mut self) {
        if self.state == ExchangeState::StreamingBody && self.inner.is_end_stream() {
            self.on_end();
        }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.on_chunk(data);
                }
                this.settle();
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                this.on_error(&err);
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.on_end();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for ObservedBody<B> {
    fn drop(&mut self) {
        self.settle();
        if self.state == ExchangeState::StreamingBody {
            self.state = ExchangeState::Failed;
            tracing::debug!(
                exchange = %self.exchange,
                label = %self.record.label(),
                bytes = self.record.seen(),
                "Body dropped before end of stream"
            );
        }
    }
}
