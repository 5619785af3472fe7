use std::sync::Arc;

use axum::{Json, debug_handler, extract::{Path, State}};
use serde_json::{Value, json};

use crate::{AppResult, negotiation::Negotiator};

use super::{Session, SessionStore};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn start_session(
    State(sessions): State<Arc<SessionStore>>,
) -> AppResult<Json<Value>> {
    let session_id = sessions.create_session().await?;
    Ok(Json(json!({ "session_id": session_id })))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn get_session(
    State(sessions): State<Arc<SessionStore>>,
    Path(id): Path<String>,
) -> AppResult<Json<Session>> {
    Ok(Json(sessions.get_session(&id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn close_session(
    State(negotiator): State<Arc<Negotiator>>,
    Path(id): Path<String>,
) -> AppResult<Json<Session>> {
    Ok(Json(negotiator.close_session(&id).await?))
}
