//! Host platform boundary
//!
//! The engine never calls an OS VPN API directly. A host (an Android
//! `VpnService` via JNI, an iOS packet tunnel, a desktop daemon) implements
//! [`Platform`] and hands it to the
//! [`SessionController`](crate::SessionController).
//!
//! # Example (desktop host)
//!
//! ```ignore
//! struct Desktop;
//!
//! #[async_trait]
//! impl Platform for Desktop {
//!     async fn establish(&self, routing: &RoutingConfig) -> Result<Arc<dyn PacketInterface>> {
//!         let device = TunDevice::create(routing, Some("tunsocks0")).map_err(|e| {
//!             if e.is_permission_denied() {
//!                 Error::PermissionDenied(e.to_string())
//!             } else {
//!                 Error::EstablishFailed(e.to_string())
//!             }
//!         })?;
//!         Ok(Arc::new(device))
//!     }
//!
//!     fn protect(&self, socket: SocketHandle, _target: &ConnectionDescriptor) -> bool {
//!         set_fwmark(socket, 0x2a).is_ok()
//!     }
//!
//!     fn notify(&self, active: bool) {}
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tunsocks_tun::{PacketInterface, RoutingConfig};

use crate::error::Result;
use crate::protect::{ConnectionDescriptor, SocketHandle, SocketProtector};

/// Platform adapter implemented by the host
#[async_trait]
pub trait Platform: Send + Sync {
    /// Establish the interface described by `routing`
    ///
    /// Fails with [`Error::PermissionDenied`](crate::Error::PermissionDenied)
    /// when the user has not granted (or has revoked) the VPN permission,
    /// and with [`Error::EstablishFailed`](crate::Error::EstablishFailed)
    /// when no usable handle was returned.
    async fn establish(&self, routing: &RoutingConfig) -> Result<Arc<dyn PacketInterface>>;

    /// Exempt `socket` from the interface's routing
    fn protect(&self, socket: SocketHandle, target: &ConnectionDescriptor) -> bool;

    /// Present the session as active or inactive to the user
    fn notify(&self, active: bool);
}

/// [`SocketProtector`] that forwards to a [`Platform`]
pub struct PlatformProtector {
    platform: Arc<dyn Platform>,
}

impl PlatformProtector {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

impl SocketProtector for PlatformProtector {
    fn protect(&self, socket: SocketHandle, target: &ConnectionDescriptor) -> bool {
        let protected = self.platform.protect(socket, target);
        if !protected {
            log::warn!("Platform refused to protect socket {} for {}", socket, target);
        }
        protected
    }
}
