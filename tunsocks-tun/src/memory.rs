//! In-process packet interface
//!
//! [`MemoryInterface`] behaves like a TUN device without touching the OS.
//! Its [`MemoryPeer`] plays the kernel side: it injects packets the
//! interface will read, collects packets written to it, and can signal end
//! of stream. Hosts use it to embed the engine behind their own packet
//! source; tests use it to drive the packet pump deterministically.
//!
//! # Example
//!
//! ```ignore
//! use tunsocks_tun::{MemoryInterface, PacketInterface};
//!
//! async fn example() {
//!     let (interface, mut peer) = MemoryInterface::pair("mem0", 1500);
//!
//!     // The OS routes a packet into the interface
//!     peer.inject(vec![0x45, 0x00, 0x00, 0x14]);
//!
//!     let mut buf = vec![0u8; 2048];
//!     let n = interface.read(&mut buf).await.unwrap();
//!
//!     // A reply is written back towards the OS
//!     interface.write(&buf[..n]).await.unwrap();
//!     let reply = peer.recv().await.unwrap();
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::interface::PacketInterface;

/// Channel-backed [`PacketInterface`]
pub struct MemoryInterface {
    info: DeviceInfo,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

/// Kernel side of a [`MemoryInterface`]
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
}

impl MemoryInterface {
    /// Create a connected interface/peer pair
    pub fn pair(name: impl Into<String>, mtu: u16) -> (Self, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let interface = Self {
            info: DeviceInfo {
                name: name.into(),
                mtu,
            },
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            closed: closed.clone(),
        };
        let peer = MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            closed,
        };

        (interface, peer)
    }
}

#[async_trait]
impl PacketInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn mtu(&self) -> u16 {
        self.info.mtu
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Error::Closed),
            guard = self.inbound.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Ok(0),
            },
        }
    }

    async fn write(&self, packet: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        self.outbound.send(packet.to_vec()).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory peer dropped",
            ))
        })?;
        Ok(packet.len())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            log::debug!("Closed memory interface: {}", self.info.name);
        }
        self.closed.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for MemoryInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInterface")
            .field("info", &self.info)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MemoryPeer {
    /// Queue a packet for the interface to read
    ///
    /// Empty packets are dropped since a zero-length read means end of
    /// stream. Returns false when the packet was not queued.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> bool {
        let packet = packet.into();
        if packet.is_empty() {
            return false;
        }
        match self.inbound {
            Some(ref tx) => tx.send(packet).is_ok(),
            None => false,
        }
    }

    /// Signal end of stream once queued packets have been read
    pub fn end_of_stream(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next packet written to the interface
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Take a written packet if one is queued
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }

    /// Check whether the interface side was closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the interface side is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
