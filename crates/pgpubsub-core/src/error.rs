//! Error types for pgpubsub.
//!
//! One variant family per failure class, matching how a caller should react:
//! connection-level failures are routed through `Event::Error` and the
//! reconnect machinery, while operation-level failures reject the call that
//! triggered them.

use thiserror::Error;

/// Result type for pgpubsub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pgpubsub.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection lifecycle (surfaced via `Event::Error`, not a call rejection)
    // ========================================================================
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connect failed after {0} retries")]
    RetryExhausted(u32),

    // ========================================================================
    // Lock subsystem
    // ========================================================================
    #[error("failed to set up channel lock: {0}")]
    LockSetup(String),

    // ========================================================================
    // Per-call database failures
    // ========================================================================
    #[error("query failed: {0}")]
    Query(String),

    // ========================================================================
    // Payload codec
    // ========================================================================
    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    // ========================================================================
    // Misuse
    // ========================================================================
    #[error("channel name \"{0}\" is reserved for the lock protocol")]
    ReservedChannel(String),

    #[error("session is closed")]
    Closed,
}

impl Error {
    /// Short machine-readable tag, useful for log fields and tests.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect_error",
            Self::RetryExhausted(_) => "retry_exhausted",
            Self::LockSetup(_) => "lock_setup_error",
            Self::Query(_) => "query_error",
            Self::Decode(_) => "decode_error",
            Self::ReservedChannel(_) => "reserved_channel",
            Self::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Connect("x".into()).code(), "connect_error");
        assert_eq!(Error::RetryExhausted(3).code(), "retry_exhausted");
        assert_eq!(Error::Closed.code(), "closed");
    }

    #[test]
    fn retry_exhausted_message_names_the_count() {
        let err = Error::RetryExhausted(3);
        assert_eq!(err.to_string(), "connect failed after 3 retries");
    }
}
