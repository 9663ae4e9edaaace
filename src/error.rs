use std::time::Duration;

use thiserror::Error;

use crate::state::{SyncState, Transition};

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("no subscription acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}

impl From<rust_decimal::Error> for TransportError {
    fn from(e: rust_decimal::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("subscription failed: {0}")]
    SubscriptionFailed(#[source] TransportError),

    #[error("no snapshot received within {0:?}")]
    Timeout(Duration),

    /// Diffs were applied to a store that never received a snapshot.
    #[error("update applied before any snapshot")]
    StoreMisuse,

    #[error("synchronization cancelled by stop()")]
    Cancelled,

    #[error("cannot apply {transition:?} in state {from}")]
    InvalidTransition {
        from: SyncState,
        transition: Transition,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;
