//! TUN device backed by `tun-rs`
//!
//! There are two ways to get a [`TunDevice`]:
//!
//! ## 1. From routing parameters (desktop hosts)
//!
//! [`TunDevice::create()`] creates a new interface with the session address
//! and MTU. This requires root or `CAP_NET_ADMIN`. Installing the routes of
//! the [`RoutingConfig`] is left to the host.
//!
//! ```rust,ignore
//! let routing = RoutingConfig::session_defaults("tunsocks");
//! let device = TunDevice::create(&routing, Some("tunsocks0"))?;
//! ```
//!
//! ## 2. From a file descriptor (mobile hosts)
//!
//! [`TunDevice::from_fd()`] adopts a descriptor established by the platform,
//! e.g. the one detached from Android's `ParcelFileDescriptor`.
//!
//! ```rust,ignore
//! let device = unsafe { TunDevice::from_fd(fd, "tun0", 1500) }?;
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use std::os::unix::io::RawFd;

use crate::config::RoutingConfig;
use crate::error::{Error, Result};
use crate::interface::PacketInterface;

/// Information about a TUN device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Interface name
    pub name: String,
    /// MTU
    pub mtu: u16,
}

/// TUN device implementing [`PacketInterface`]
///
/// The `tun-rs` device sits behind an `Arc` that in-flight reads and writes
/// clone. [`close`](PacketInterface::close) cancels them and drops the
/// device's own reference, so the descriptor is released as soon as the
/// last pending call returns.
pub struct TunDevice {
    inner: Mutex<Option<Arc<tun_rs::AsyncDevice>>>,
    closed: CancellationToken,
    info: DeviceInfo,
}

impl TunDevice {
    /// Create a new TUN device for the given routing parameters
    ///
    /// # Platform Requirements
    ///
    /// - **Linux**: Requires root or `CAP_NET_ADMIN` capability
    /// - **macOS**: Requires root privileges
    /// - **Windows**: Requires Administrator and WinTun driver
    pub fn create(routing: &RoutingConfig, name: Option<&str>) -> Result<Self> {
        routing.validate()?;

        let mut builder = tun_rs::DeviceBuilder::new();

        if let Some(name) = name {
            builder = builder.name(name);
        }

        builder = builder
            .ipv4(
                routing.interface_addr(),
                routing.address.prefix_len(),
                Some(routing.peer_addr()),
            )
            .mtu(routing.mtu);

        let device = builder.build_async().map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::Io(e)
            } else {
                Error::DeviceCreation(e.to_string())
            }
        })?;

        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        log::info!("Created TUN device: {} (MTU: {})", name, routing.mtu);

        Ok(Self::wrap(device, name, routing.mtu))
    }

    /// Adopt a file descriptor established by the platform
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `fd` is a valid, open file descriptor for a TUN device
    /// - ownership of `fd` is transferred: nothing else closes it
    #[cfg(unix)]
    pub unsafe fn from_fd(fd: RawFd, name: impl Into<String>, mtu: u16) -> Result<Self> {
        let device = tun_rs::AsyncDevice::from_fd(fd).map_err(|e| {
            Error::DeviceCreation(format!("failed to create device from fd: {}", e))
        })?;

        let name = name.into();
        log::info!("Created TUN device from fd {}: {} (MTU: {})", fd, name, mtu);

        Ok(Self::wrap(device, name, mtu))
    }

    fn wrap(device: tun_rs::AsyncDevice, name: String, mtu: u16) -> Self {
        Self {
            inner: Mutex::new(Some(Arc::new(device))),
            closed: CancellationToken::new(),
            info: DeviceInfo { name, mtu },
        }
    }

    /// Get device information
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn device(&self) -> Result<Arc<tun_rs::AsyncDevice>> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::Closed)
    }
}

#[async_trait]
impl PacketInterface for TunDevice {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn mtu(&self) -> u16 {
        self.info.mtu
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let device = self.device()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            result = device.recv(buf) => result.map_err(Error::Io),
        }
    }

    async fn write(&self, packet: &[u8]) -> Result<usize> {
        let device = self.device()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            result = device.send(packet) => result.map_err(Error::Io),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.cancel();
        let device = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if device.is_some() {
            log::info!("Closed TUN device: {}", self.info.name);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}
