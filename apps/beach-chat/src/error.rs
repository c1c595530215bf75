use thiserror::Error;

use crate::session::SessionState;
use crate::signaling::SignalingError;
use crate::transport::TransportError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("signaling store unavailable: {0}")]
    SignalingUnavailable(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(SessionState),
    #[error("session closed")]
    Closed,
}

impl From<SignalingError> for ChatError {
    fn from(err: SignalingError) -> Self {
        ChatError::SignalingUnavailable(err.to_string())
    }
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        ChatError::HandshakeFailed(err.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
