use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::{
    engine::{EngineError, EngineFactory, IceCandidate, NegotiationEngine},
    peer::{FailureReason, PeerConnection, PeerState},
};
use crate::{
    error::{RelayError, RelayResult},
    relay::{Delivery, Relay, Topic},
    sessions::{Session, SessionStatus, SessionStore},
    task::AbortOnDrop,
};

/// How the answer reaches the offering peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Returned as the response to the offer
    #[default]
    Inline,
    /// Published on the session's topic, with candidates following it
    Relay,
}

#[derive(Error, Debug)]
#[error("unknown delivery mode `{0}` (expected `inline` or `relay`)")]
pub struct ParseDeliveryModeError(String);

impl FromStr for DeliveryMode {
    type Err = ParseDeliveryModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "relay" => Ok(Self::Relay),
            other => Err(ParseDeliveryModeError(other.to_owned())),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inline => "inline",
            Self::Relay => "relay",
        })
    }
}

/// What travels on a session topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Answer { sdp: String },
    Candidate(IceCandidate),
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, Serialize)]
pub struct Negotiated {
    pub session_id: String,
    pub state: PeerState,
    /// Present in inline mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub relayed: bool,
}

/// Owns an engine until it is closed. An engine dropped unclosed (the offer
/// future was cancelled) is closed on a background task.
struct EngineHandle {
    engine: Arc<dyn NegotiationEngine>,
    closed: bool,
}

impl EngineHandle {
    fn new(engine: Box<dyn NegotiationEngine>) -> Self {
        Self {
            engine: Arc::from(engine),
            closed: false,
        }
    }

    fn get(&self) -> &dyn NegotiationEngine {
        self.engine.as_ref()
    }

    async fn close(mut self) {
        self.closed = true;
        self.engine.close().await;
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let engine = self.engine.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { engine.close().await });
            }
            Err(_) => warn!("engine dropped outside the runtime"),
        }
    }
}

/// Engine of an established negotiation, kept until the session closes or a
/// fresh offer replaces it.
struct LivePeer {
    engine: EngineHandle,
    _candidates: AbortOnDrop<()>,
}

/// Removes the session from the in-flight set on every exit path.
struct InFlight<'a> {
    set: &'a DashSet<String>,
    session_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(self.session_id);
    }
}

/// Drives offer/answer exchanges for existing sessions.
pub struct Negotiator {
    sessions: Arc<SessionStore>,
    relay: Relay,
    engines: Arc<dyn EngineFactory>,
    mode: DeliveryMode,
    in_flight: DashSet<String>,
    live: DashMap<String, LivePeer>,
}

impl Negotiator {
    pub fn new(
        sessions: Arc<SessionStore>,
        relay: Relay,
        engines: Arc<dyn EngineFactory>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            sessions,
            relay,
            engines,
            mode,
            in_flight: DashSet::new(),
            live: DashMap::new(),
        }
    }

    /// Whether an established engine is held for the session.
    pub fn is_live(&self, session_id: &str) -> bool {
        self.live.contains_key(session_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Negotiate an answer to `offer` for an existing, active session.
    ///
    /// Nothing is created for a session that does not exist. A failed attempt
    /// is not retried; the caller submits a fresh offer instead.
    #[instrument(skip(self, offer), fields(mode = %self.mode))]
    pub async fn submit_offer(&self, session_id: &str, offer: &str) -> RelayResult<Negotiated> {
        if offer.trim().is_empty() {
            return Err(RelayError::InvalidInput("offer must not be empty".into()));
        }
        let session = self.sessions.get_session(session_id).await?;
        if session.status == SessionStatus::Closed {
            return Err(RelayError::InvalidInput(format!("session {session_id} is closed")));
        }

        if !self.in_flight.insert(session_id.to_owned()) {
            return Err(RelayError::InvalidOffer("negotiation already in progress".into()));
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            session_id,
        };

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let engine = self
            .engines
            .create(candidate_tx)
            .await
            .map(EngineHandle::new)
            .map_err(|err| RelayError::NegotiationEngineError(err.to_string()))?;

        // everything the engine reports is surfaced by the forwarder; the
        // copies coming back on `seen` are recorded without blocking
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let forwarder = AbortOnDrop::spawn(forward_candidates(
            session_id.to_owned(),
            candidate_rx,
            seen_tx,
            (self.mode == DeliveryMode::Relay).then(|| self.relay.clone()),
        ));

        let mut peer = PeerConnection::new(session_id);
        let answer = match self.negotiate(&mut peer, engine.get(), offer).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(session_id, %err, state = ?peer.state(), "negotiation failed");
                engine.close().await;
                return Err(err);
            }
        };
        while let Ok(candidate) = seen.try_recv() {
            peer.record_candidate(candidate);
        }

        let previous = self.live.insert(
            session_id.to_owned(),
            LivePeer {
                engine,
                _candidates: forwarder,
            },
        );
        if let Some(previous) = previous {
            debug!(session_id, "replacing previous negotiation");
            previous.engine.close().await;
        }

        // a close that ran while this offer was negotiating found nothing
        // to release; the engine is only kept for a session still active
        match self.sessions.get_session_status(session_id).await {
            Ok(SessionStatus::Active) => {}
            outcome => {
                self.release(session_id).await;
                return Err(match outcome {
                    Err(err) => err,
                    Ok(_) => RelayError::InvalidInput(format!(
                        "session {session_id} was closed during negotiation"
                    )),
                });
            }
        }

        info!(
            session_id,
            candidates = peer.candidates().len(),
            "negotiation established"
        );
        Ok(Negotiated {
            session_id: session_id.to_owned(),
            state: peer.state(),
            relayed: self.mode == DeliveryMode::Relay,
            answer: (self.mode == DeliveryMode::Inline).then_some(answer),
        })
    }

    /// Close and forget the engine held for the session, if any.
    async fn release(&self, session_id: &str) -> bool {
        let Some((_, live)) = self.live.remove(session_id) else {
            return false;
        };
        live.engine.close().await;
        debug!(session_id, "negotiation released");
        true
    }

    /// Release engines held for sessions that are closed or gone (expired,
    /// or deleted behind the negotiator's back).
    pub async fn sweep(&self) -> RelayResult<usize> {
        let held: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        let mut released = 0;
        for session_id in held {
            match self.sessions.get_session_status(&session_id).await {
                Ok(SessionStatus::Active) => continue,
                Ok(SessionStatus::Closed) | Err(RelayError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            if self.release(&session_id).await {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Sweep every `period` until the negotiator is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) {
        let negotiator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(negotiator) = negotiator.upgrade() else {
                    break;
                };
                match negotiator.sweep().await {
                    Ok(0) => {}
                    Ok(released) => debug!(released, "released stale negotiations"),
                    Err(err) => warn!(%err, "negotiation sweep failed"),
                }
            }
        });
    }

    /// Run the state machine to `Established`, returning the local answer.
    async fn negotiate(
        &self,
        peer: &mut PeerConnection,
        engine: &dyn NegotiationEngine,
        offer: &str,
    ) -> RelayResult<String> {
        if let Err(err) = engine.set_remote_description(offer).await {
            return Err(self.failed(peer, err));
        }
        peer.set_remote_offer(offer)?;

        let answer = match engine.create_local_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.failed(peer, err)),
        };
        peer.answer_created(answer.clone())?;

        if self.mode == DeliveryMode::Relay {
            let topic = Topic::session(peer.session_id());
            let signal = SignalMessage::Answer { sdp: answer.clone() };
            if let Err(err) = self.relay.publish_json(&topic, &signal).await {
                peer.fail(FailureReason::TransportUnavailable, err.to_string())?;
                return Err(err);
            }
        }

        if let Err(err) = engine.set_local_description(&answer).await {
            return Err(self.failed(peer, err));
        }
        peer.establish()?;
        Ok(answer)
    }

    fn failed(&self, peer: &mut PeerConnection, err: EngineError) -> RelayError {
        let reason = match err {
            EngineError::InvalidOffer(_) => FailureReason::InvalidOffer,
            EngineError::Internal(_) => FailureReason::NegotiationEngineError,
        };
        match peer.fail(reason, err.to_string()) {
            Ok(failure) => failure.into(),
            Err(transition) => transition.into(),
        }
    }

    /// Relay a raw signaling body to everyone bound to the session.
    #[instrument(skip(self, message))]
    pub async fn relay_signal(&self, session_id: &str, message: &str) -> RelayResult<()> {
        if !self.sessions.session_exists(session_id).await? {
            return Err(RelayError::NotFound(format!("session {session_id}")));
        }
        self.relay
            .publish(&Topic::session(session_id), Delivery::text(message))
            .await
    }

    /// Close the session and release any engine held for it.
    pub async fn close_session(&self, session_id: &str) -> RelayResult<Session> {
        let session = self.sessions.close_session(session_id).await?;
        self.release(session_id).await;
        Ok(session)
    }
}

async fn forward_candidates(
    session_id: String,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    seen: mpsc::UnboundedSender<IceCandidate>,
    relay: Option<Relay>,
) {
    let topic = Topic::session(&session_id);
    while let Some(candidate) = candidates.recv().await {
        debug!(session_id = %session_id, candidate = %candidate.candidate, "ice candidate");
        if let Some(relay) = &relay {
            let signal = SignalMessage::Candidate(candidate.clone());
            // failures are logged by the relay; a lost candidate is not fatal
            let _ = relay.publish_json(&topic, &signal).await;
        }
        let _ = seen.send(candidate);
    }
}
