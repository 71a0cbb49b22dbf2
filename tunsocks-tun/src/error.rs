//! Error types for tunsocks-tun

use std::io;
use thiserror::Error;

/// Result type alias for tunsocks-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving an interface
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// The interface was closed; pending and later reads/writes fail with this
    #[error("interface closed")]
    Closed,
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if the error was caused by closing the interface
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}
