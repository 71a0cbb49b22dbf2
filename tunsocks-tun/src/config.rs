//! Routing parameters established on the virtual interface

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// Address assigned to the interface in the session network block
pub const SESSION_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 43, 1);

/// Prefix length of the session network block
pub const SESSION_PREFIX_LEN: u8 = 24;

/// Interface address with its prefix, checked at compile time
pub const SESSION_NETWORK: Ipv4Net = Ipv4Net::new_assert(SESSION_ADDRESS, SESSION_PREFIX_LEN);

/// Resolvers advertised to the OS while the session is up
pub const SESSION_DNS_SERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// Routing configuration for one session
///
/// Built once while a session is being established and never changed
/// afterwards. Hosts translate it into their platform API (a `VpnService`
/// builder, a `tun-rs` device builder, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Label shown by the host for this session
    pub session_name: String,
    /// Interface address with its prefix length
    pub address: Ipv4Net,
    /// Routes captured by the interface
    pub routes: Vec<Ipv4Net>,
    /// DNS servers advertised to the OS
    pub dns_servers: Vec<IpAddr>,
    /// Maximum transmission unit
    pub mtu: u16,
}

impl RoutingConfig {
    /// The fixed session parameters: `192.168.43.1/24`, a catch-all
    /// `0.0.0.0/0` route, Google public DNS and a 1500 byte MTU.
    pub fn session_defaults(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            address: SESSION_NETWORK,
            routes: vec![Ipv4Net::default()],
            dns_servers: SESSION_DNS_SERVERS.iter().copied().map(IpAddr::V4).collect(),
            mtu: DEFAULT_MTU,
        }
    }

    /// Interface address without the prefix
    pub fn interface_addr(&self) -> Ipv4Addr {
        self.address.addr()
    }

    /// Second host address in the session block, handed to the packet stack
    /// as the far end of the point-to-point link
    pub fn peer_addr(&self) -> Ipv4Addr {
        let own = self.address.addr();
        self.address
            .hosts()
            .find(|candidate| *candidate != own)
            .unwrap_or(own)
    }

    /// Network mask of the interface address
    pub fn netmask(&self) -> Ipv4Addr {
        self.address.netmask()
    }

    /// Check whether every packet is routed into the interface
    pub fn routes_everything(&self) -> bool {
        self.routes.iter().any(|route| route.prefix_len() == 0)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.prefix_len() == 0 || self.address.prefix_len() > 30 {
            return Err(Error::InvalidPrefix(format!(
                "interface prefix length {} leaves no room for a peer address",
                self.address.prefix_len()
            )));
        }

        if self.address.addr().is_unspecified() {
            return Err(Error::InvalidAddress(self.address.addr().to_string()));
        }

        if self.routes.is_empty() {
            return Err(Error::Config("at least one route must be configured".into()));
        }

        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }

        Ok(())
    }
}
