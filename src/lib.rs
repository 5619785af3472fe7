pub mod chat;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiation;
pub mod relay;
pub mod rooms;
pub mod sessions;
pub mod store;
pub mod task;

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        FromRef,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};

use chat::Chat;
use clock::Clock;
use config::Config;
use error::{ErrorKind, RelayError};
use negotiation::{EngineFactory, Negotiator};
use relay::Relay;
use sessions::SessionStore;
use store::KvStore;

/// Everything a handler may need. Components are built once by the entry
/// point and shared by reference.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub negotiator: Arc<Negotiator>,
    pub chat: Arc<Chat>,
    pub relay: Relay,
}

impl AppState {
    pub fn new(
        config: &Config,
        kv: Arc<dyn KvStore>,
        relay: Relay,
        engines: Arc<dyn EngineFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(
            kv.clone(),
            clock.clone(),
            config.session_ttl,
            config.room_ttl,
        ));
        let negotiator = Arc::new(Negotiator::new(
            sessions.clone(),
            relay.clone(),
            engines,
            config.delivery_mode,
        ));
        let chat = Arc::new(Chat::new(kv, relay.clone(), clock, config.history_limit));
        Self {
            sessions,
            negotiator,
            chat,
            relay,
        }
    }
}

pub fn app(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(sessions::router())
        .merge(negotiation::router())
        .merge(chat::router())
        .nest("/rooms", rooms::router())
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "OK"
}

pub type AppResult<T> = Result<T, AppError>;

/// A core error on its way out of a handler.
#[derive(Debug)]
pub struct AppError(pub RelayError);

#[derive(Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::StoreUnavailable
            | ErrorKind::BrokerUnavailable
            | ErrorKind::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidOffer => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NegotiationEngineError => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(ErrorBody {
                kind,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

macro_rules! rejection_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(RelayError::InvalidInput(err.body_text()))
            }
        }
    };
}

rejection_impl!(JsonRejection);
rejection_impl!(QueryRejection);
