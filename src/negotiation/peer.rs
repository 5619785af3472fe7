use serde::Serialize;
use thiserror::Error;

use super::engine::IceCandidate;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    OfferSet,
    AnswerCreated,
    Established,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidOffer,
    NegotiationEngineError,
    TransportUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl From<Failure> for RelayError {
    fn from(failure: Failure) -> Self {
        match failure.reason {
            FailureReason::InvalidOffer => Self::InvalidOffer(failure.detail),
            FailureReason::NegotiationEngineError => Self::NegotiationEngineError(failure.detail),
            FailureReason::TransportUnavailable => Self::TransportUnavailable(failure.detail),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} while {from:?}")]
pub struct TransitionError {
    pub from: PeerState,
    pub action: &'static str,
}

impl From<TransitionError> for RelayError {
    fn from(err: TransitionError) -> Self {
        Self::NegotiationEngineError(err.to_string())
    }
}

/// One offer/answer attempt for a session.
///
/// `New -> OfferSet -> AnswerCreated -> Established`, or `Failed` from any
/// non-terminal state. Nothing ever moves backward and terminal states are
/// absorbing: a transition attempted from one returns an error and leaves
/// the connection untouched. Candidates may be recorded in any state.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    session_id: String,
    state: PeerState,
    failure: Option<Failure>,
    local_description: Option<String>,
    remote_description: Option<String>,
    candidates: Vec<IceCandidate>,
}

impl PeerConnection {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: PeerState::New,
            failure: None,
            local_description: None,
            remote_description: None,
            candidates: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    /// In arrival order.
    pub fn candidates(&self) -> &[IceCandidate] {
        &self.candidates
    }

    fn advance(
        &mut self,
        expected: PeerState,
        next: PeerState,
        action: &'static str,
    ) -> Result<(), TransitionError> {
        if self.state != expected {
            return Err(TransitionError {
                from: self.state,
                action,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn set_remote_offer(&mut self, sdp: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(PeerState::New, PeerState::OfferSet, "set remote offer")?;
        self.remote_description = Some(sdp.into());
        Ok(())
    }

    pub fn answer_created(&mut self, sdp: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(PeerState::OfferSet, PeerState::AnswerCreated, "create answer")?;
        self.local_description = Some(sdp.into());
        Ok(())
    }

    pub fn establish(&mut self) -> Result<(), TransitionError> {
        self.advance(PeerState::AnswerCreated, PeerState::Established, "set local answer")
    }

    pub fn fail(
        &mut self,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<Failure, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError {
                from: self.state,
                action: "fail",
            });
        }
        let failure = Failure {
            reason,
            detail: detail.into(),
        };
        self.state = PeerState::Failed;
        self.failure = Some(failure.clone());
        Ok(failure)
    }

    pub fn record_candidate(&mut self, candidate: IceCandidate) {
        self.candidates.push(candidate);
    }
}
