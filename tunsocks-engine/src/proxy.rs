//! Proxy endpoint boundary
//!
//! The stack never dials the user's upstream proxy itself. It talks SOCKS5
//! to a [`ProxyEndpoint`] bound to an ephemeral loopback port, and the
//! endpoint opens the real, protected connection to the upstream.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::event::SessionStatsRef;
use crate::protect::SocketProtectorRef;

/// What an endpoint needs from the session it serves
#[derive(Clone)]
pub struct EndpointContext {
    /// Must be applied to every socket opened to the real network
    pub protector: SocketProtectorRef,
    /// Session counters
    pub stats: SessionStatsRef,
}

/// Locally bound proxy service
#[async_trait]
pub trait ProxyEndpoint: Send + Sync {
    /// Bind and start serving; returns the local address to hand to the stack
    async fn start(&self, upstream: &ProxyConfig, context: EndpointContext) -> Result<SocketAddr>;

    /// Stop serving and close all connections
    async fn stop(&self) -> Result<()>;

    /// Local address while running
    fn local_addr(&self) -> Option<SocketAddr>;
}
