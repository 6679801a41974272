//! Transport errors

use thiserror::Error;

/// Errors that can occur while talking to the device
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected to device")]
    NotConnected,

    #[error("Command timed out")]
    Timeout,

    #[error("Device rejected command: {0:?}")]
    UnsupportedCommand(String),

    #[error("Link not frame-aligned, probe answered {0:?}")]
    Misaligned(String),

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport has shut down")]
    Closed,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_serial::Error> for TransportError {
    fn from(e: tokio_serial::Error) -> Self {
        TransportError::SerialError(e.to_string())
    }
}

/// Result alias used across the transport
pub type Result<T> = std::result::Result<T, TransportError>;
