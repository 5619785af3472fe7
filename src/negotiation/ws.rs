use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    debug_handler,
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use futures_util::StreamExt;
use tracing::info;

use crate::{
    AppResult,
    connection::{self, FrameHandler},
    error::RelayError,
    relay::{Relay, Topic},
    sessions::SessionStore,
};

use super::Negotiator;

/// Inbound frames are relayed as raw signaling bodies to the session topic.
struct SessionFrames {
    negotiator: Arc<Negotiator>,
    session_id: String,
}

#[async_trait]
impl FrameHandler for SessionFrames {
    async fn on_text(&mut self, text: String) -> Option<String> {
        self.negotiator
            .relay_signal(&self.session_id, &text)
            .await
            .err()
            .map(|err| connection::error_frame(&err))
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn session_ws(
    Path(session_id): Path<String>,
    State(sessions): State<Arc<SessionStore>>,
    State(negotiator): State<Arc<Negotiator>>,
    State(relay): State<Relay>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    if !sessions.session_exists(&session_id).await? {
        return Err(RelayError::NotFound(format!("session {session_id}")).into());
    }

    // bound before the upgrade so nothing published from here on is missed
    let subscription = relay.subscribe(&Topic::session(&session_id)).await?;
    info!(%session_id, queue = %subscription.queue(), "session socket bound");

    let capacity = relay.queue_capacity();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let frames = SessionFrames {
            negotiator,
            session_id,
        };
        connection::drive(sink, stream, subscription, frames, capacity).await;
    }))
}
