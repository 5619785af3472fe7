mod routes;
mod store;

use axum::{Router, routing::{get, post}};

use crate::AppState;

pub use store::{Room, Session, SessionStatus, SessionStore};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start-session", post(routes::start_session))
        .route("/session/{id}", get(routes::get_session))
        .route("/session/{id}/close", post(routes::close_session))
}
