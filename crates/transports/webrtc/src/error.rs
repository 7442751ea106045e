//! Error types for the mirrorcast WebRTC layer

use thiserror::Error;

/// Result type alias for mirrorcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while negotiating, routing and tearing down sessions
#[derive(Debug, Error)]
pub enum Error {
    /// The remote offer is malformed or cannot be satisfied.
    ///
    /// Surfaced to the signaling caller; the session that raised it is discarded.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The connection failed after negotiation completed
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Recording destination could not be written
    #[error("Sink error: {0}")]
    Sink(String),

    /// Local capture source is missing or cannot be opened
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// The registry is closing and no longer accepts sessions
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Error reported by the underlying WebRTC engine
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error belongs to the synchronous negotiation phase
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Error::Negotiation(_))
    }

    /// Stable machine-readable code used in HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Negotiation(_) => "negotiation_failed",
            Error::TransportFailure(_) => "transport_failure",
            Error::Sink(_) => "sink_error",
            Error::CaptureUnavailable(_) => "capture_unavailable",
            Error::ShuttingDown => "shutting_down",
            Error::WebRtc(_) => "webrtc_error",
            Error::Config(_) => "invalid_config",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::Negotiation("bad".into()).code(), "negotiation_failed");
        assert_eq!(Error::ShuttingDown.code(), "shutting_down");
        assert!(Error::Negotiation("x".into()).is_negotiation());
        assert!(!Error::Sink("x".into()).is_negotiation());
    }

    #[test]
    fn test_error_display() {
        let err = Error::CaptureUnavailable("no such file".to_string());
        assert_eq!(err.to_string(), "Capture unavailable: no such file");
    }
}
