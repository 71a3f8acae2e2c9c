//! Capture subsystem: the logging side-channel of every exchange.
//!
//! # Data Flow
//! ```text
//! request/response body frame
//!     → body.rs (ObservedBody decorator, exchange state machine)
//!     → record.rs (bounded copy, best-effort text rendering)
//!     → Observer (rendered off the forwarding path)
//!
//! header map → headers.rs (HeaderBlock snapshot)
//! ```
//!
//! # Design Decisions
//! - Capture borrows each chunk; the forwarded frame is passed on
//!   untouched
//! - Records are owned by one exchange and dropped with it
//! - Rendering never fails; bad UTF-8 degrades to U+FFFD

pub mod body;
pub mod headers;
pub mod record;

pub use body::{EmitPolicy, ExchangeState, Inspector, ObservedBody, ReadEvent};
pub use headers::HeaderBlock;
pub use record::{CaptureLabel, CaptureRecord, RenderedCapture};
