//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, accept via the HTTP server)
//!     → connection.rs (exchange identity for observation)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - One port, one logical service
//! - No admission control; accept indefinitely

pub mod connection;
pub mod listener;

pub use connection::ExchangeId;
pub use listener::{bind, ListenerError};
