//! Error types for DuelNet.

use thiserror::Error;

use crate::protocol::ErrorCode;

pub type Result<T> = std::result::Result<T, DuelError>;

#[derive(Error, Debug)]
pub enum DuelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DuelError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }
}

/// Rejection of a client event, reported back to the sender only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("already queued or in an active battle")]
    AlreadyActive,

    #[error("not a participant of battle {battle_id}")]
    Unauthorized { battle_id: String },

    #[error("{0}")]
    InvalidState(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyActive => ErrorCode::AlreadyActive,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState(reason.into())
    }

    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload(reason.into())
    }

    pub fn unauthorized(battle_id: impl Into<String>) -> Self {
        Self::Unauthorized {
            battle_id: battle_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_codes() {
        assert_eq!(DispatchError::AlreadyActive.code(), ErrorCode::AlreadyActive);
        assert_eq!(DispatchError::unauthorized("b1").code(), ErrorCode::Unauthorized);
        assert_eq!(
            DispatchError::RateLimited { retry_after_ms: 10 }.code(),
            ErrorCode::RateLimited
        );
        assert_eq!(DispatchError::invalid_state("ended").to_string(), "ended");
    }
}
