//! Engine error taxonomy.

use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::protocol::ProtocolError;

/// Errors surfaced by the session engine.
///
/// `Credential`, `Connect` and `Handshake` are startup failures;
/// `Transport` is a mid-session disconnect; `State` and cursor-related
/// `Protocol` errors mean the caller broke the call contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Missing or unparsable PEM material.
    #[error("credential error: {0}")]
    Credential(String),

    /// Endpoint unreachable or invalid, or the link was lost before the
    /// join was answered.
    #[error("connect error: {0}")]
    Connect(String),

    /// The relay refused the room or protocol version.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Operation not valid in the current lifecycle state.
    #[error("{operation} is not allowed while {state:?}")]
    State {
        operation: &'static str,
        state: LifecycleState,
    },

    /// Malformed frame or plot-cursor misuse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport dropped mid-session.
    #[error("transport error: {0}")]
    Transport(String),
}

impl EngineError {
    pub(crate) fn state(operation: &'static str, state: LifecycleState) -> Self {
        Self::State { operation, state }
    }

    /// "Your usage is wrong" as opposed to "the network is wrong".
    pub fn is_misuse(&self) -> bool {
        match self {
            Self::State { .. } => true,
            Self::Protocol(e) => e.is_misuse(),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
