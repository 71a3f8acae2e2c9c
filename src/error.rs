//! Exchange-scoped errors.
//!
//! Every variant ends one exchange only. The client sees the mapped status
//! (or a closed connection once streaming has begun); the listener keeps
//! accepting.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request target could not be turned into an upstream URI.
    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),

    /// Upstream did not answer in time.
    #[error("Upstream timed out after {0} seconds")]
    Timeout(u64),

    /// A body stopped producing frames mid-stream.
    #[error("Body idle for {0} seconds")]
    BodyIdle(u64),

    /// TCP connect to the upstream did not complete in time.
    #[error("Upstream connect timed out")]
    ConnectTimeout,

    /// Upstream connection or request failed.
    #[error("Upstream request failed: {0}")]
    Upstream(hyper_util::client::legacy::Error),

    /// Upstream WebSocket handshake failed.
    #[error("Upstream upgrade failed: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() && timed_out(&err) {
            ProxyError::ConnectTimeout
        } else {
            ProxyError::Upstream(err)
        }
    }
}

/// True if any error in the source chain is an I/O timeout.
fn timed_out(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = e.source();
    }
    false
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ProxyError::WebSocket(Box::new(err))
    }
}

impl ProxyError {
    /// Status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout(_) | ProxyError::ConnectTimeout | ProxyError::BodyIdle(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::Upstream(_) | ProxyError::WebSocket(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_gateway_statuses() {
        assert_eq!(ProxyError::Timeout(5).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::ConnectTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::BodyIdle(1).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::InvalidTarget("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        let ws = ProxyError::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert_eq!(ws.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ws.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn finds_timeout_in_source_chain() {
        #[derive(Debug, Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let nested = Outer(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(timed_out(&nested));

        let refused = Outer(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no"));
        assert!(!timed_out(&refused));
    }
}
