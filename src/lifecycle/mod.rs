//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     Trigger → listener stops accepting → process exits
//! ```
//!
//! # Design Decisions
//! - In-flight exchanges are not drained; exit is immediate once the
//!   accept loop ends

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
