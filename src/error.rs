use std::fmt;

use thiserror::Error;

/// Configuration-time failures. Any of these aborts start-up before a single
/// packet is sent.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("port {port} is driven by '{found}' but the engine was configured for '{expected}'")]
    DriverMismatch {
        port: u16,
        expected: String,
        found: String,
    },

    #[error("driver '{driver}' on port {port} lacks required capability: {capability}")]
    CapabilityMissing {
        port: u16,
        driver: String,
        capability: &'static str,
    },

    #[error("link on port {0} is still down after the stabilization wait")]
    LinkDown(u16),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("queue {queue} on port {port} is already owned by another core")]
    QueueBusy { port: u16, queue: u16 },

    #[error("port {port} setup failed: {reason}")]
    PortSetup { port: u16, reason: String },

    #[error("failed to spawn core thread: {0}")]
    Spawn(String),
}

/// Returned by a full ring. Carries the rejected message so the producer keeps
/// ownership of whatever it embedded.
pub struct RingFull<T>(pub T);

impl<T> RingFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RingFull(..)")
    }
}

impl<T> fmt::Display for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ring is full")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_port() {
        let err = EngineError::CapabilityMissing {
            port: 3,
            driver: "vnic".to_string(),
            capability: "drop queue",
        };
        let text = err.to_string();
        assert!(text.contains("port 3"));
        assert!(text.contains("vnic"));
        assert!(text.contains("drop queue"));
    }

    #[test]
    fn test_ring_full_returns_payload() {
        let full = RingFull(vec![1u8, 2, 3]);
        assert_eq!(format!("{:?}", full), "RingFull(..)");
        assert_eq!(full.into_inner(), vec![1, 2, 3]);
    }
}
