// src/error.rs - Error taxonomy for board operations and the bridge transport
use thiserror::Error;

use crate::address::PortName;

/// Failures raised synchronously by Board operations.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Unsupported pin: {0}")]
    UnsupportedPin(String),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("I2C device {0:#04x} has not been configured")]
    UnknownDevice(u8),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failures reported by a transport. Cloneable so a single failure can be
/// fanned out to every subscriber of the board's error channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Bridge connection closed")]
    Closed,
    #[error("Coprocessor replied NACK")]
    Nack,
    #[error("No socket for port {0}")]
    NoSocket(PortName),
    #[error("Unsupported by transport: {0}")]
    Unsupported(String),
    #[error("Unexpected reply byte {0:#04x}")]
    UnexpectedReply(u8),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
