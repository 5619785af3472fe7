pub mod engine;
mod loopback;
mod negotiator;
mod offer;
mod peer;
mod rtc;
mod ws;

use axum::{Router, routing::{get, post}};

use crate::AppState;

pub use engine::{EngineFactory, IceCandidate, NegotiationEngine};
pub use loopback::LoopbackEngineFactory;
pub use negotiator::{DeliveryMode, Negotiated, Negotiator, SignalMessage};
pub use peer::{PeerConnection, PeerState};
pub use rtc::RtcEngineFactory;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/offer", post(offer::submit_offer))
        .route("/signal", post(offer::relay_signal))
        .route("/session/{id}/ws", get(ws::session_ws))
}
