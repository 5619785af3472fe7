use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Query, State, rejection::{JsonRejection, QueryRejection}},
};
use serde::Deserialize;

use crate::AppResult;

use super::{Chat, ChatMessage};

#[derive(Debug, Deserialize)]
pub(crate) struct SendChatRequest {
    username: String,
    room: String,
    content: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn send_chat(
    State(chat): State<Arc<Chat>>,
    body: Result<Json<SendChatRequest>, JsonRejection>,
) -> AppResult<Json<ChatMessage>> {
    let Json(SendChatRequest { username, room, content }) = body?;
    Ok(Json(chat.send(&username, &room, &content).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    room: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    State(chat): State<Arc<Chat>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    let Query(HistoryQuery { room }) = query?;
    Ok(Json(chat.history(&room).await?))
}
