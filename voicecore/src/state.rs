//! Connection lifecycle state machine.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Waiting for the control plane and opening the signaling socket.
    Connecting,
    AwaitingHello,
    AwaitingReady,
    SelectingProtocol,
    AwaitingSessionDescription,
    /// Media parameters are known and packets may flow.
    Streaming,
    Paused,
    /// Reconnecting to the same session after a transient loss.
    Resuming,
    Faulted,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Faulted | Self::Disposed)
    }

    /// States in which the session must hold media parameters.
    pub fn has_media(self) -> bool {
        matches!(self, Self::Streaming | Self::Paused | Self::Resuming)
    }

    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        if self.is_terminal() {
            return false;
        }
        if self == to {
            return true;
        }
        match (self, to) {
            (_, Connecting | Faulted | Disposed) => true,
            (Connecting, AwaitingHello)
            | (AwaitingHello, AwaitingReady)
            | (AwaitingReady, SelectingProtocol)
            | (SelectingProtocol, AwaitingSessionDescription)
            | (AwaitingSessionDescription, Streaming)
            | (Streaming, Paused)
            | (Paused, Streaming)
            | (Streaming, Resuming)
            | (Paused, Resuming)
            | (Resuming, Streaming)
            | (Resuming, Paused) => true,
            _ => false,
        }
    }

    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
