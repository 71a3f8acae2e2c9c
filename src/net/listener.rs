//! TCP listener binding.
//!
//! # Responsibilities
//! - Bind exactly one configured address
//! - Report the bound address (port 0 resolves to a real port)
//!
//! No connection limit is enforced here; every accepted connection is
//! handed to the HTTP server.

use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Bind address could not be parsed.
    #[error("Invalid bind address '{address}': {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Bind the configured address.
pub async fn bind(config: &ListenerConfig) -> Result<TcpListener, ListenerError> {
    let addr: SocketAddr =
        config
            .bind_address
            .parse()
            .map_err(|source| ListenerError::Address {
                address: config.bind_address.clone(),
                source,
            })?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(address = %local_addr, "Listener bound");

    Ok(listener)
}
