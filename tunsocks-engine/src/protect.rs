//! Socket protection
//!
//! While a session is running every packet the OS sends is routed into the
//! interface, including the packets of the relay's own connection to the
//! upstream proxy. Those would loop back into the stack and deadlock the
//! whole path. A [`SocketProtector`] exempts one socket from the interface's
//! routing (Android's `VpnService.protect(fd)`, an `SO_MARK` on Linux, ...).
//!
//! Protection is a one-time operation on an unconnected socket and cannot
//! be applied afterwards, so every outbound socket goes through
//! [`connect_protected`]: create, protect, and only then connect. A
//! protector that refuses abandons that connection with
//! [`Error::ProtectionFailed`]; it is never routed unprotected.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpSocket, TcpStream};

use crate::error::{Error, Result};

/// Raw OS handle of a socket
#[cfg(unix)]
pub type SocketHandle = std::os::unix::io::RawFd;

/// Raw OS handle of a socket
#[cfg(windows)]
pub type SocketHandle = std::os::windows::io::RawSocket;

/// Transport protocol of an outbound flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One outbound flow about to be opened against the real network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub destination: SocketAddr,
    pub protocol: Protocol,
}

impl ConnectionDescriptor {
    pub fn tcp(destination: SocketAddr) -> Self {
        Self {
            destination,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(destination: SocketAddr) -> Self {
        Self {
            destination,
            protocol: Protocol::Udp,
        }
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.destination)
    }
}

/// Exempts sockets from the interface's routing
///
/// Called concurrently from many connection attempts; implementations must
/// be thread-safe.
pub trait SocketProtector: Send + Sync {
    /// Protect `socket` before it connects to `target`
    ///
    /// Returns false if the socket could not be exempted.
    fn protect(&self, socket: SocketHandle, target: &ConnectionDescriptor) -> bool;
}

/// Protector for hosts where sockets never enter the interface
///
/// Used by the standalone relay and on desktop setups that route the
/// upstream around the interface themselves.
#[derive(Debug, Clone, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: SocketHandle, _target: &ConnectionDescriptor) -> bool {
        true
    }
}

/// A protector that calls a closure
///
/// Useful for FFI hosts that forward to a platform callback.
pub struct FnProtector<F> {
    protect_fn: F,
}

impl<F> FnProtector<F>
where
    F: Fn(SocketHandle, &ConnectionDescriptor) -> bool + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { protect_fn: f }
    }
}

impl<F> SocketProtector for FnProtector<F>
where
    F: Fn(SocketHandle, &ConnectionDescriptor) -> bool + Send + Sync,
{
    fn protect(&self, socket: SocketHandle, target: &ConnectionDescriptor) -> bool {
        (self.protect_fn)(socket, target)
    }
}

pub type SocketProtectorRef = Arc<dyn SocketProtector>;

/// Open a TCP connection whose socket was protected before connecting
pub async fn connect_protected(
    protector: &dyn SocketProtector,
    target: ConnectionDescriptor,
) -> Result<TcpStream> {
    let socket = if target.destination.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if !protector.protect(raw_handle(&socket), &target) {
        log::warn!("Cannot protect the socket for {}", target);
        return Err(Error::ProtectionFailed {
            target: target.destination,
        });
    }

    let stream = socket.connect(target.destination).await?;
    log::debug!("Connected protected socket to {}", target);
    Ok(stream)
}

#[cfg(unix)]
fn raw_handle(socket: &TcpSocket) -> SocketHandle {
    use std::os::unix::io::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_handle(socket: &TcpSocket) -> SocketHandle {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}
