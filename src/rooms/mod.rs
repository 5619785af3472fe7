mod new;
mod room;

use axum::{Router, routing::{get, post}};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(new::new_room))
        .route("/{id}", get(room::room))
        .route("/{id}/join", post(room::join))
        .route("/{id}/leave", post(room::leave))
}
