use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;

use crate::{AppResult, sessions::{Room, SessionStore}};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn room(
    State(sessions): State<Arc<SessionStore>>,
    Path(room_id): Path<String>,
) -> AppResult<Json<Room>> {
    Ok(Json(sessions.get_room(&room_id).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PeerRequest {
    peer_id: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn join(
    State(sessions): State<Arc<SessionStore>>,
    Path(room_id): Path<String>,
    body: Result<Json<PeerRequest>, JsonRejection>,
) -> AppResult<Json<Room>> {
    let Json(PeerRequest { peer_id }) = body?;
    Ok(Json(sessions.join_room(&room_id, &peer_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn leave(
    State(sessions): State<Arc<SessionStore>>,
    Path(room_id): Path<String>,
    body: Result<Json<PeerRequest>, JsonRejection>,
) -> AppResult<StatusCode> {
    let Json(PeerRequest { peer_id }) = body?;
    sessions.leave_room(&room_id, &peer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
