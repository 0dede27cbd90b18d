use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session ended. Attached once, when the session becomes `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectionReason {
    DisconnectedByClient,
    ConnectionLost,
    ConnectionFailed,
    CannotReadLength,
    ReadError,
    RxBufferSizeExceeded,
    HandshakeValidationFailed,
    SendingHandshakeResponseFailed,
    ServerRxBufferToSmall,
    DecryptionFailed,
    DeserializationFailed,
    MessageValidationFailed,
}

impl DisconnectionReason {
    pub fn description(self) -> &'static str {
        match self {
            Self::DisconnectedByClient => "disconnect requested by the client",
            Self::ConnectionLost => "connection to the server was lost",
            Self::ConnectionFailed => "could not establish a session with the server",
            Self::CannotReadLength => "frame length could not be read",
            Self::ReadError => "frame payload could not be read",
            Self::RxBufferSizeExceeded => "server frame exceeds the receive buffer",
            Self::HandshakeValidationFailed => "server handshake failed validation",
            Self::SendingHandshakeResponseFailed => "handshake response could not be sent",
            Self::ServerRxBufferToSmall => "server receive buffer is below the protocol minimum",
            Self::DecryptionFailed => "frame failed authenticated decryption",
            Self::DeserializationFailed => "decrypted message is malformed",
            Self::MessageValidationFailed => "message sequence or timestamp is invalid",
        }
    }
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Lifecycle of one query session.
///
/// ```text
/// Idle -> Connecting -> AwaitingHandshake -> Connected
///           \________________\__________________\____-> Disconnected(reason)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingHandshake,
    Connected,
    Disconnected(DisconnectionReason),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionState {
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, AwaitingHandshake)
                | (AwaitingHandshake, Connected)
                | (Connecting | AwaitingHandshake | Connected, Disconnected(_))
        );
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected(_))
    }

    pub fn disconnection_reason(self) -> Option<DisconnectionReason> {
        match self {
            SessionState::Disconnected(reason) => Some(reason),
            _ => None,
        }
    }
}
