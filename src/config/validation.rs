//! Configuration validation.
//!
//! Serde handles syntax; this pass checks values. All problems are
//! collected so a bad file is reported in one go.

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a configuration, returning every error found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.upstream.host.trim().is_empty() {
        errors.push(ValidationError::new("upstream.host", "must not be empty"));
    }
    if config.upstream.port == 0 {
        errors.push(ValidationError::new("upstream.port", "must be non-zero"));
    }

    if config.capture.max_bytes == 0 {
        errors.push(ValidationError::new("capture.max_bytes", "must be greater than 0"));
    }
    if config.capture.queue_capacity == 0 {
        errors.push(ValidationError::new(
            "capture.queue_capacity",
            "must be greater than 0",
        ));
    }
    if config.capture.max_pending_acks == 0 {
        errors.push(ValidationError::new(
            "capture.max_pending_acks",
            "must be greater than 0",
        ));
    }
    if !config.capture.polling_path.starts_with('/') {
        errors.push(ValidationError::new(
            "capture.polling_path",
            format!("'{}' must start with '/'", config.capture.polling_path),
        ));
    }

    for (field, value) in [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
