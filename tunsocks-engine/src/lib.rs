//! Tunsocks Engine
//!
//! This crate runs a TUN-to-SOCKS session: packets the OS routes into a
//! virtual interface are handed to a user-space network stack, which turns
//! them into SOCKS connections to a local relay, which in turn dials the
//! configured upstream proxy over sockets exempted from the interface.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            │              SessionController               │
//!            │  start / stop / revoke / handle(action)      │
//!            └──┬──────────────┬───────────────┬────────────┘
//!               │              │               │
//!               ▼              ▼               ▼
//!         ┌──────────┐  ┌─────────────┐  ┌────────────┐
//!         │ Platform │  │ PacketStack │  │ LocalRelay │──► upstream SOCKS5
//!         │ establish│  │             │  │ (protected │
//!         │ protect  │  │             │  │  sockets)  │
//!         └────┬─────┘  └──▲───────┬──┘  └─────▲──────┘
//!              │           │       │           │
//!              ▼           │       ▼           │
//!      PacketInterface ──► reader  sink ──► PacketInterface
//!                                  └── SOCKS5 ─┘
//! ```
//!
//! The controller owns everything a session acquires and releases it in a
//! fixed order, whether the session ends on request, on revocation or
//! because the interface went away underneath it.

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod platform;
pub mod protect;
pub mod proxy;
pub mod reader;
pub mod relay;
pub mod session;
pub mod sink;
pub mod stack;

pub use config::{parse_port, Config, Credentials, ProxyConfig, SessionSettings, DEFAULT_PROXY_PORT};
pub use control::ControlAction;
pub use error::{Error, Result};
pub use event::{
    EventHandler, LoggingEventHandler, SessionEvent, SessionState, SessionStats, SessionStatsRef,
    StatsSnapshot, StopReason,
};
pub use platform::{Platform, PlatformProtector};
pub use protect::{
    connect_protected, ConnectionDescriptor, FnProtector, NoopProtector, Protocol, SocketHandle,
    SocketProtector, SocketProtectorRef,
};
pub use proxy::{EndpointContext, ProxyEndpoint};
pub use reader::{InterfaceReader, ReaderExit, ReaderHandle};
pub use relay::LocalRelay;
pub use session::{SessionController, SessionControllerBuilder};
pub use sink::{InterfaceSink, PacketSink};
pub use stack::{PacketStack, StackConfig};

pub use tunsocks_tun;
