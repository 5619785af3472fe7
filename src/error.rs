//! Error taxonomy shared by every core component.

use serde::Serialize;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced by the session store, negotiation and relay components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Session or room absent (or expired)
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed or unacceptable request
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Backing key/value store could not be reached
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Fanout transport down or publish/subscribe failed
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Negotiation engine rejected the remote offer
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// Negotiation engine failed internally
    #[error("negotiation engine error: {0}")]
    NegotiationEngineError(String),

    /// The end connection dropped mid-operation
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    StoreUnavailable,
    BrokerUnavailable,
    InvalidOffer,
    NegotiationEngineError,
    TransportUnavailable,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::BrokerUnavailable(_) => ErrorKind::BrokerUnavailable,
            Self::InvalidOffer(_) => ErrorKind::InvalidOffer,
            Self::NegotiationEngineError(_) => ErrorKind::NegotiationEngineError,
            Self::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
        }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}
