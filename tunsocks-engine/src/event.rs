//! Session events, state and statistics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Session lifecycle state
///
/// Transitions follow `Idle → Establishing → Running → Stopping → Idle`.
/// Once a resource has been acquired the way back to `Idle` always passes
/// through `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Acquiring the proxy endpoint and the interface
    Establishing,
    /// Packets are being pumped
    Running,
    /// Releasing resources
    Stopping,
}

impl SessionState {
    /// Check if a session holds resources in this state
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Establishing => "Establishing...",
            SessionState::Running => "Running",
            SessionState::Stopping => "Stopping...",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why a session was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop or disconnect action
    Requested,
    /// The OS revoked the interface permission
    Revoked,
    /// The interface reported end of stream
    EndOfStream,
    /// Reading from the interface failed
    Fault(String),
    /// Establishing did not complete
    Aborted(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::Revoked => write!(f, "permission revoked"),
            StopReason::EndOfStream => write!(f, "interface reached end of stream"),
            StopReason::Fault(e) => write!(f, "interface read failed: {}", e),
            StopReason::Aborted(e) => write!(f, "start aborted: {}", e),
        }
    }
}

/// Events emitted by the session controller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    /// Session is up
    Started {
        /// Interface name
        interface: String,
        /// Local address of the proxy endpoint
        proxy_addr: SocketAddr,
    },

    /// Session was torn down
    Stopped {
        /// Reason for the teardown
        reason: StopReason,
    },

    /// Error occurred
    Error {
        /// Error message
        message: String,
        /// Whether the session survives the error
        recoverable: bool,
    },
}

/// Event handler trait for receiving session events
///
/// Events arrive one at a time and in order, after the controller has
/// released its lifecycle lock, so a handler may call back into the
/// controller (for example `stop` on [`SessionEvent::Error`]). Events
/// caused by such a call are delivered once the handler returns.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a session event
    async fn on_event(&self, event: SessionEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { old, new } => {
                log::info!("Session state: {} -> {}", old, new);
            }
            SessionEvent::Started {
                interface,
                proxy_addr,
            } => {
                log::info!("Session started: interface={}, proxy={}", interface, proxy_addr);
            }
            SessionEvent::Stopped { reason } => {
                log::info!("Session stopped: {}", reason);
            }
            SessionEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
        }
    }
}

/// Counters shared by the reader, the sink and the relay
///
/// `rx` is traffic read from the interface, `tx` is traffic written to it.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub packets_rx: AtomicU64,
    pub packets_tx: AtomicU64,
    pub write_errors: AtomicU64,
    pub connections: AtomicU64,
    pub protect_failures: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet read from the interface
    pub fn record_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet written to the interface
    pub fn record_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a swallowed write failure
    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a relayed connection
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a socket that could not be protected
    pub fn record_protect_failure(&self) {
        self.protect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            protect_failures: self.protect_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of stats at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub write_errors: u64,
    pub connections: u64,
    pub protect_failures: u64,
}

pub type SessionStatsRef = Arc<SessionStats>;
