//! Transparent observing HTTP and event-stream proxy library

pub mod capture;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use observability::{MemorySink, Observer};
