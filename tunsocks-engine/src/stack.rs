//! User-space network stack boundary
//!
//! The stack parses the IP packets read from the interface, maps TCP/UDP
//! flows onto SOCKS connections to the proxy endpoint, and hands reply
//! packets back through a [`PacketSink`](crate::PacketSink). Its protocol
//! translation is opaque to the engine, which only drives it in this order:
//!
//! 1. [`set_log_level`](PacketStack::set_log_level)
//! 2. [`start`](PacketStack::start)
//! 3. [`input_packet`](PacketStack::input_packet), repeatedly
//! 4. [`stop`](PacketStack::stop), after the interface reader was joined

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tunsocks_tun::RoutingConfig;

use crate::error::Result;
use crate::sink::PacketSink;

/// Parameters the stack is started with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Local address of the proxy endpoint
    pub upstream: SocketAddr,
    /// Address of the interface
    pub interface_addr: Ipv4Addr,
    /// Far end of the point-to-point link
    pub interface_addr_alt: Ipv4Addr,
    /// MTU of the interface
    pub mtu: u16,
}

impl StackConfig {
    pub fn new(upstream: SocketAddr, routing: &RoutingConfig) -> Self {
        Self {
            upstream,
            interface_addr: routing.interface_addr(),
            interface_addr_alt: routing.peer_addr(),
            mtu: routing.mtu,
        }
    }
}

/// Packet-flow counterpart that turns packets into proxy connections
#[async_trait]
pub trait PacketStack: Send + Sync {
    /// Set the stack's own log verbosity
    fn set_log_level(&self, level: log::LevelFilter);

    /// Start the stack; replies are written to `sink`
    async fn start(&self, sink: Arc<dyn PacketSink>, config: StackConfig) -> Result<()>;

    /// Feed one packet read from the interface
    async fn input_packet(&self, packet: &[u8]);

    /// Stop accepting packets and close all flows
    async fn stop(&self);
}
