use std::fmt;
use thiserror::Error;

/// Which admission ceiling refused a new camera worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionScope {
    /// Ceiling on workers across all devices.
    Total,
    /// Ceiling on workers for a single device.
    Device,
}

impl fmt::Display for AdmissionScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Total => write!(f, "total"),
            Self::Device => write!(f, "per-device"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("Transport error on {port}: {message}")]
    Transport { port: String, message: String },

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    #[error("Frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch { expected: String, actual: String },

    // Admission and resource errors
    #[error("Camera worker limit reached ({scope} limit {limit})")]
    AdmissionLimit { scope: AdmissionScope, limit: usize },

    #[error("Camera worker unavailable: {0}")]
    ResourceExhaustion(String),

    #[error("Camera frame unavailable: {0}")]
    FrameUnavailable(String),

    // Lookup errors
    #[error("Node offline: {0}")]
    NodeOffline(String),

    #[error("No node assigned to setup {0}")]
    NoNodeAssigned(String),

    #[error("No camera assigned to setup {0}")]
    NoCameraAssigned(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a transport error for a port.
    pub fn transport(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an unexpected-message error.
    pub fn unexpected(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedMessage {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a not-found error for the given record kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a node command that failed with this error may be attempted again.
    ///
    /// Transport failures, timeouts and undecodable or oversized lines are
    /// retried; a well-formed reply of the wrong kind is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout(_)
                | Self::Protocol(_)
                | Self::FrameTooLarge { .. }
                | Self::Io(_)
                | Self::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
