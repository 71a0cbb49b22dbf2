//! Virtual interface layer for tunsocks
//!
//! This crate describes the interface a session establishes and gives the
//! engine packet-level access to it.
//!
//! # Features
//!
//! - **Routing parameters**: [`RoutingConfig`] with the fixed session
//!   defaults (`192.168.43.1/24`, catch-all route, public DNS, MTU 1500)
//! - **Packet access**: the [`PacketInterface`] trait, cancellable by closing
//! - **TUN devices**: [`TunDevice`] on top of `tun-rs`, created directly or
//!   adopted from a platform-provided file descriptor
//! - **In-memory interface**: [`MemoryInterface`] for embedding and tests
//!
//! # Platform Requirements
//!
//! Creating a [`TunDevice`] needs root or `CAP_NET_ADMIN` on Linux, root on
//! macOS and Administrator plus the WinTun driver on Windows. Adopting a
//! descriptor handed over by a mobile VPN service needs nothing extra.
//!
//! # Example
//!
//! ```ignore
//! use tunsocks_tun::{PacketInterface, RoutingConfig, TunDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let routing = RoutingConfig::session_defaults("tunsocks");
//!     let device = TunDevice::create(&routing, Some("tunsocks0"))?;
//!
//!     let mut buf = vec![0u8; 2048];
//!     let n = device.read(&mut buf).await?;
//!     println!("Received {} bytes", n);
//!
//!     device.close()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod interface;
pub mod memory;

pub use config::{RoutingConfig, SESSION_NETWORK};
pub use device::{DeviceInfo, TunDevice};
pub use error::{Error, Result};
pub use interface::PacketInterface;
pub use memory::{MemoryInterface, MemoryPeer};

/// Default MTU of the session interface
pub const DEFAULT_MTU: u16 = 1500;

/// Default label for a session
pub const DEFAULT_SESSION_NAME: &str = "tunsocks";

/// Read buffer size covering the default MTU with headroom
pub const DEFAULT_READ_BUFFER: usize = 2048;
