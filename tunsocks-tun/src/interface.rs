//! Packet-level access to a virtual interface
//!
//! A [`PacketInterface`] has a readable side (packets the OS routed into the
//! interface) and a writable side (packets injected back towards the OS).
//! Both sides are usable concurrently through a shared reference, so one
//! task can block on [`read`](PacketInterface::read) while others write.
//!
//! # Closing
//!
//! [`close`](PacketInterface::close) is the only way to cancel a pending
//! read. It must:
//!
//! - make every in-flight and later `read` return [`Error::Closed`],
//! - make every later `write` return [`Error::Closed`],
//! - release the underlying descriptor once in-flight calls have returned,
//! - be idempotent.
//!
//! [`Error::Closed`]: crate::Error::Closed

use async_trait::async_trait;

use crate::error::Result;

/// Async packet interface implemented by TUN devices and test doubles
#[async_trait]
pub trait PacketInterface: Send + Sync + std::fmt::Debug {
    /// Interface name (e.g., "tun0")
    fn name(&self) -> &str;

    /// Configured MTU
    fn mtu(&self) -> u16;

    /// Read one packet into `buf`
    ///
    /// Returns the packet length, truncated to `buf.len()`. `Ok(0)` means
    /// the device reported end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet
    async fn write(&self, packet: &[u8]) -> Result<usize>;

    /// Close the interface, unblocking any pending read
    fn close(&self) -> Result<()>;

    /// Check whether [`close`](Self::close) has been called
    fn is_closed(&self) -> bool;
}
