//! Exchange identity.
//!
//! Every inbound request (or upgraded connection) gets a process-unique
//! [`ExchangeId`]. It tags each observation so output from concurrent
//! exchanges can be told apart.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global atomic counter for exchange IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static EXCHANGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(u64);

impl ExchangeId {
    /// Generate a new unique exchange ID.
    pub fn new() -> Self {
        Self(EXCHANGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ex-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_id_unique() {
        let id1 = ExchangeId::new();
        let id2 = ExchangeId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn exchange_id_display() {
        let id = ExchangeId::new();
        assert_eq!(id.to_string(), format!("ex-{}", id.as_u64()));
    }
}
