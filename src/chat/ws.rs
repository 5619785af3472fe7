use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    debug_handler,
    extract::{Query, State, WebSocketUpgrade, rejection::QueryRejection},
    response::Response,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::info;

use crate::{
    AppResult,
    connection::{self, FrameHandler},
    error::RelayError,
    relay::{Relay, Topic},
};

use super::Chat;

#[derive(Debug, Deserialize)]
pub(crate) struct ChatSocketQuery {
    username: String,
    room: String,
}

/// Every inbound text frame is the content of one chat message.
struct ChatFrames {
    chat: Arc<Chat>,
    username: String,
    room: String,
}

#[async_trait]
impl FrameHandler for ChatFrames {
    async fn on_text(&mut self, text: String) -> Option<String> {
        self.chat
            .send(&self.username, &self.room, &text)
            .await
            .err()
            .map(|err| connection::error_frame(&err))
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_ws(
    State(chat): State<Arc<Chat>>,
    State(relay): State<Relay>,
    query: Result<Query<ChatSocketQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let Query(ChatSocketQuery { username, room }) = query?;
    let (username, room) = (username.trim().to_owned(), room.trim().to_owned());
    if username.is_empty() || room.is_empty() {
        return Err(RelayError::InvalidInput("username and room are required".into()).into());
    }

    // bind first: the history endpoint covers anything published earlier
    let subscription = relay.subscribe(&Topic::chat(&room)).await?;
    info!(%room, %username, queue = %subscription.queue(), "chat socket bound");

    let capacity = relay.queue_capacity();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let frames = ChatFrames {
            chat,
            username,
            room,
        };
        connection::drive(sink, stream, subscription, frames, capacity).await;
    }))
}
