//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarding path produces:
//!     → observer.rs (Observation queue, rendered to capture lines)
//!     → logging.rs  (tracing subscriber: operator log + capture lines)
//! ```
//!
//! # Design Decisions
//! - Observation is side-effect only; forwarding never waits on it
//! - Exchange ID flows through every observation and log event

pub mod logging;
pub mod observer;

pub use observer::{LineSink, MemorySink, Observation, Observer, Side, TracingSink};
