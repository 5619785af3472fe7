use std::sync::Arc;

use axum::{Json, debug_handler, extract::State, http::StatusCode};

use crate::{AppResult, sessions::{Room, SessionStore}};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn new_room(
    State(sessions): State<Arc<SessionStore>>,
) -> AppResult<(StatusCode, Json<Room>)> {
    Ok((StatusCode::CREATED, Json(sessions.create_room().await?)))
}
