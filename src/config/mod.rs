//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → CLI overrides applied in main
//!     → ProxyConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; no hot reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::CaptureConfig;
pub use schema::ListenerConfig;
pub use schema::ObservabilityConfig;
pub use schema::ProxyConfig;
pub use schema::TimeoutConfig;
pub use schema::UpstreamConfig;
pub use validation::{validate_config, ValidationError};
