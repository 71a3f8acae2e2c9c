//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request line + headers observed)
//!     → websocket.rs (upgrade requests: relay frames both ways)
//!     → server.rs forward (everything else: stream body to upstream)
//!     → upstream response streamed back, body observed chunk by chunk
//!     → idle.rs (both bodies fail once quiet for the idle timeout)
//!     → polling.rs (polling bodies split into packets, acks paired per session)
//! ```

pub mod idle;
pub mod polling;
pub mod server;
pub mod websocket;

pub use server::{AppState, HttpServer};
pub use websocket::{FrameLog, RelaySettings};
