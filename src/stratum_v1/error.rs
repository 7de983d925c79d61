//! Stratum client error types.

use thiserror::Error;

pub type StratumResult<T> = Result<T, StratumError>;

#[derive(Error, Debug)]
pub enum StratumError {
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by pool")]
    Disconnected,

    #[error("timed out waiting for pool response")]
    Timeout,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("pool requested reconnect")]
    ReconnectRequested,
}
