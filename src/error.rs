//! Error types shared across the bus runtime.
//!
//! Transport, dispatch, and consumer failures surface as [`BusError`].
//! Schema and encoding failures live in [`crate::codec::CodecError`] and
//! convert into `BusError` at the dispatch boundary. Business failures
//! raised by service methods are [`ServiceError`] and travel over the wire
//! as structured error responses.

use std::time::Duration;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publishing or opening resources while the connection is down.
    #[error("not connected to broker")]
    NotConnected,

    /// A pending RPC was aborted because the connection was lost after the
    /// request was published.
    #[error("connection lost while awaiting reply")]
    Disconnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Structured failure returned by a remote service method.
    ///
    /// `handled` marks a business-semantic rejection that consumers must
    /// not retry.
    #[error("{message} ({code})")]
    Service {
        message: String,
        code: String,
        handled: bool,
    },

    /// The connection manager gave up after exhausting its retry budget.
    #[error("reconnection attempts exhausted after {0} tries")]
    ReconnectionExhausted(u32),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(#[from] lapin::Error),

    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
}

impl BusError {
    /// True when the failure is a permanent business rejection rather than
    /// an infrastructure fault.
    pub fn is_handled(&self) -> bool {
        matches!(self, BusError::Service { handled: true, .. })
    }
}

/// Business failure raised by a service method handler.
///
/// Handled errors propagate to the caller and are never retried; unhandled
/// errors drive the consumer retry and dead-letter machinery.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ServiceError {
    pub message: String,
    pub code: String,
    pub handled: bool,
}

impl ServiceError {
    /// A permanent business-rule rejection. Propagated to the caller,
    /// never retried.
    pub fn handled(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            handled: true,
        }
    }

    /// An unexpected failure. Subject to the consumer's retry policy.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "INTERNAL_ERROR".to_string(),
            handled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handled_classification() {
        let err = BusError::Service {
            message: "bad input".to_string(),
            code: "VALIDATION_ERROR".to_string(),
            handled: true,
        };
        assert!(err.is_handled());
        assert!(!BusError::NotConnected.is_handled());
    }

    #[test]
    fn test_service_error_constructors() {
        let handled = ServiceError::handled("VALIDATION_ERROR", "bad");
        assert!(handled.handled);
        assert_eq!(handled.code, "VALIDATION_ERROR");

        let internal = ServiceError::internal("boom");
        assert!(!internal.handled);
        assert_eq!(internal.code, "INTERNAL_ERROR");
    }
}
