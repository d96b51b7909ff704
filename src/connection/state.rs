//! Connection lifecycle states and the transitions allowed between them
//!
//! Everything here is pure; the manager applies transitions under its lock
//! and publishes the result on a watch channel.

use std::fmt;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`super::ConnectionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    /// Terminal until the next connect call
    Failed,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Failed)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnecting)
                | (Reconnecting, Disconnected)
                | (Disconnecting, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }

    /// A state no background activity will move away from on its own
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Disconnected
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Session exists or is being re-established
    pub fn is_session_alive(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Log a state transition at a level that matches its severity
pub fn log_state_transition(broker_uri: &str, from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!(broker = %broker_uri, "Connection established");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting) => {
            warn!(broker = %broker_uri, "Connection lost, reconnecting");
        }
        (ConnectionState::Reconnecting, ConnectionState::Connected) => {
            info!(broker = %broker_uri, "Reconnection successful");
        }
        (_, ConnectionState::Failed) => {
            error!(broker = %broker_uri, from = %from, "Connection failed");
        }
        (_, ConnectionState::Disconnected) => {
            info!(broker = %broker_uri, from = %from, "Disconnected");
        }
        _ => {
            debug!(broker = %broker_uri, "Connection state: {} -> {}", from, to);
        }
    }
}
