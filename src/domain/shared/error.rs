//! Engine errors

use thiserror::Error;

/// Errors returned synchronously by engine operations.
///
/// An operation that fails with one of these has not touched any handle,
/// dialog or transaction state and has produced no network traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Pending response already consumed: {0}")]
    TokenConsumed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::infrastructure::protocols::sip::SipError> for EngineError {
    fn from(err: crate::infrastructure::protocols::sip::SipError) -> Self {
        EngineError::InvalidOperation(err.to_string())
    }
}
