mod history;
mod msg;
mod ws;

use std::sync::Arc;

use axum::{Router, routing::{get, post}};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::{
    AppState,
    clock::Clock,
    error::{RelayError, RelayResult},
    relay::{Relay, Topic},
    store::KvStore,
};

pub use history::HistoryLog;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(msg::send_chat))
        .route("/history", get(msg::history))
        .route("/ws", get(ws::chat_ws))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub content: String,
    pub room: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Chat path: every message goes to the room's history and its fanout.
pub struct Chat {
    history: HistoryLog,
    relay: Relay,
    clock: Arc<dyn Clock>,
}

impl Chat {
    pub fn new(kv: Arc<dyn KvStore>, relay: Relay, clock: Arc<dyn Clock>, history_limit: usize) -> Self {
        Self {
            history: HistoryLog::new(kv, history_limit),
            relay,
            clock,
        }
    }

    /// Record and fan out one message.
    ///
    /// Both writes are attempted even when the first fails; the first
    /// failure is returned.
    #[instrument(skip(self, content))]
    pub async fn send(&self, username: &str, room: &str, content: &str) -> RelayResult<ChatMessage> {
        let username = required("username", username)?;
        let room = required("room", room)?;
        if content.trim().is_empty() {
            return Err(RelayError::InvalidInput("content must not be empty".into()));
        }

        let message = ChatMessage {
            username: username.to_owned(),
            content: content.to_owned(),
            room: room.to_owned(),
            timestamp: self.clock.now(),
        };

        let stored = self
            .history
            .append(&message)
            .await
            .inspect_err(|err| warn!(room, %err, "history append failed"));
        let published = self.relay.publish_json(&Topic::chat(room), &message).await;
        stored.and(published)?;

        debug!(room, username, "chat message sent");
        Ok(message)
    }

    pub async fn history(&self, room: &str) -> RelayResult<Vec<ChatMessage>> {
        self.history.recent(required("room", room)?).await
    }
}

fn required<'a>(name: &str, value: &'a str) -> RelayResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RelayError::InvalidInput(format!("{name} must not be empty")));
    }
    Ok(value)
}
