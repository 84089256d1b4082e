//! Error types for hardware operations.
//!
//! Hardware errors describe what went wrong at the device boundary (a port
//! vanished, a read timed out, a worker binary could not be started). They
//! convert into [`sensorhub_core::Error`] at the runtime boundary so retry
//! and admission logic only deal with one error type.

use sensorhub_core::Error as CoreError;

/// Result type alias for hardware operations.
pub type Result<T> = std::result::Result<T, HardwareError>;

/// Errors that can occur during hardware device operations.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// Device is not connected or has been disconnected.
    #[error("Device disconnected: {device}")]
    Disconnected { device: String },

    /// Operation timed out after specified duration.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Serial communication error.
    #[error("Communication error on {port}: {message}")]
    CommunicationError { port: String, message: String },

    /// Invalid data received from device.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Worker process could not be started.
    #[error("Failed to spawn worker: {message}")]
    SpawnFailed { message: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    /// Create a new disconnected error.
    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a new communication error.
    pub fn communication(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommunicationError {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a new spawn failure error.
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
        }
    }
}

impl From<serialport::Error> for HardwareError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => Self::disconnected(err.description),
            serialport::ErrorKind::Io(kind) => Self::Io(std::io::Error::new(kind, err.description)),
            _ => Self::communication("serial", err.description),
        }
    }
}

impl From<HardwareError> for CoreError {
    fn from(err: HardwareError) -> Self {
        match err {
            HardwareError::Disconnected { device } => CoreError::transport(device, "disconnected"),
            HardwareError::Timeout { duration_ms } => CoreError::Timeout(duration_ms),
            HardwareError::CommunicationError { port, message } => {
                CoreError::transport(port, message)
            }
            HardwareError::InvalidData { message } => CoreError::Protocol(message),
            HardwareError::SpawnFailed { message } => CoreError::ResourceExhaustion(message),
            HardwareError::Io(err) => CoreError::Io(err),
        }
    }
}
