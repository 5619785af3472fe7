//! Boundary to the negotiation engine that owns ICE/DTLS. The core only
//! hands it descriptions and listens for the candidates it discovers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Where an engine reports candidates as it discovers them. Unbounded so the
/// engine's callback never waits on the core.
pub type CandidateSender = mpsc::UnboundedSender<IceCandidate>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The remote description was rejected
    #[error("{0}")]
    InvalidOffer(String),

    #[error("{0}")]
    Internal(String),
}

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn set_remote_description(&self, sdp: &str) -> Result<(), EngineError>;

    async fn create_local_answer(&self) -> Result<String, EngineError>;

    async fn set_local_description(&self, sdp: &str) -> Result<(), EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// A fresh engine for one negotiation attempt.
    async fn create(&self, candidates: CandidateSender) -> Result<Box<dyn NegotiationEngine>, EngineError>;
}
