//! Session control actions delivered by the host

use std::str::FromStr;

use crate::error::Error;

/// Named signal from the hosting environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Start the session (idempotent)
    Connect,
    /// Stop the session (idempotent)
    Disconnect,
}

impl ControlAction {
    /// Map an optional host action name to an action
    ///
    /// Hosts that restart the service without an explicit action (e.g. a
    /// sticky service being recreated) connect.
    pub fn from_host(action: Option<&str>) -> Self {
        match action.map(str::parse::<ControlAction>) {
            Some(Ok(action)) => action,
            Some(Err(_)) | None => ControlAction::Connect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Connect => "CONNECT",
            ControlAction::Disconnect => "DISCONNECT",
        }
    }
}

impl FromStr for ControlAction {
    type Err = Error;

    /// Accepts `CONNECT`/`DISCONNECT` in any case, and fully qualified host
    /// action names ending in `.START`/`.STOP`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('.').next().unwrap_or(s).to_ascii_uppercase();
        match name.as_str() {
            "CONNECT" | "START" => Ok(ControlAction::Connect),
            "DISCONNECT" | "STOP" => Ok(ControlAction::Disconnect),
            _ => Err(Error::Config(format!("unknown control action: {}", s))),
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
