//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the observing proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// The single upstream every exchange is forwarded to.
    pub upstream: UpstreamConfig,

    /// Body and frame capture settings.
    pub capture: CaptureConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
        }
    }
}

/// Upstream target. Static for the lifetime of the process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream host name or IP.
    pub host: String,

    /// Upstream port.
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
        }
    }
}

impl UpstreamConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Capture configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Enable body and frame capture. When disabled nothing is wrapped.
    pub enabled: bool,

    /// Maximum bytes retained and rendered per capture record.
    /// Bytes past the cap are still forwarded.
    pub max_bytes: usize,

    /// Observations buffered before new ones are dropped.
    pub queue_capacity: usize,

    /// Callbacks per upgraded connection held while waiting for their ack.
    /// The oldest is reported unacknowledged when a new one would exceed it.
    pub max_pending_acks: usize,

    /// Path prefix of the long-polling transport. Bodies of
    /// `transport=polling` exchanges under it are decoded into packets.
    pub polling_path: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 64 * 1024,
            queue_capacity: 4096,
            max_pending_acks: 1024,
            polling_path: "/socket.io/".to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed until the upstream response headers arrive, in seconds.
    pub request_secs: u64,

    /// Seconds a streamed body or upgraded connection may sit with no
    /// traffic before it is cut off.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 300,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_demonstrated_ports() {
        let config = ProxyConfig::default();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8000");
        assert_eq!(config.upstream.authority(), "localhost:9000");
        assert!(config.capture.enabled);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [upstream]
            port = 9100

            [capture]
            max_bytes = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream.host, "localhost");
        assert_eq!(config.upstream.port, 9100);
        assert_eq!(config.capture.max_bytes, 16);
        assert_eq!(config.capture.queue_capacity, 4096);
        assert_eq!(config.capture.max_pending_acks, 1024);
        assert_eq!(config.timeouts.connect_secs, 5);
    }

    #[test]
    fn ipv6_authority_is_bracketed() {
        let upstream = UpstreamConfig {
            host: "::1".into(),
            port: 9000,
        };
        assert_eq!(upstream.authority(), "[::1]:9000");
    }
}
