//! Error types for the session engine

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or running a session
#[derive(Debug, Error)]
pub enum Error {
    /// The OS declined to create the interface; the user must re-authorize
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Interface creation returned no usable handle
    #[error("failed to establish interface: {0}")]
    EstablishFailed(String),

    /// A socket could not be exempted from the interface's routing
    #[error("socket to {target} could not be protected")]
    ProtectionFailed {
        /// Destination of the abandoned connection
        target: SocketAddr,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Proxy endpoint error
    #[error("proxy error: {0}")]
    Proxy(String),

    /// SOCKS negotiation error
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// User-space stack error
    #[error("stack error: {0}")]
    Stack(String),

    /// Interface error
    #[error("interface error: {0}")]
    Tun(#[from] tunsocks_tun::Error),
}

impl Error {
    /// Check if this error ends the start attempt that produced it
    pub fn is_establish_error(&self) -> bool {
        matches!(self, Error::PermissionDenied(_) | Error::EstablishFailed(_))
    }

    /// Check if this error only affects a single connection
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::ProtectionFailed { .. } | Error::Socks(_) | Error::Io(_)
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
