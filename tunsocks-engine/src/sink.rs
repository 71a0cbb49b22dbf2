//! Write side of the packet pump

use std::sync::Arc;

use async_trait::async_trait;
use tunsocks_tun::PacketInterface;

use crate::event::SessionStatsRef;

/// Receives packets the stack wants delivered to the OS
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Deliver one packet; failures are handled inside the sink
    async fn write_packet(&self, packet: &[u8]);
}

/// Writes stack output verbatim to the interface
///
/// The stack may call this from any flow's callback and may keep the sink
/// after the session stopped, so write failures are logged and swallowed.
/// Once the interface is closed, writes fail without touching the device.
pub struct InterfaceSink {
    interface: Arc<dyn PacketInterface>,
    stats: SessionStatsRef,
}

impl InterfaceSink {
    pub fn new(interface: Arc<dyn PacketInterface>, stats: SessionStatsRef) -> Self {
        Self { interface, stats }
    }
}

#[async_trait]
impl PacketSink for InterfaceSink {
    async fn write_packet(&self, packet: &[u8]) {
        log::trace!("Output size={}", packet.len());
        match self.interface.write(packet).await {
            Ok(_) => self.stats.record_tx(packet.len()),
            Err(e) if e.is_closed() => {
                self.stats.record_write_error();
                log::debug!("Dropped {} byte packet, interface closed", packet.len());
            }
            Err(e) => {
                self.stats.record_write_error();
                log::warn!("Failed to write to {}: {}", self.interface.name(), e);
            }
        }
    }
}
