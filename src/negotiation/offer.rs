use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;

use crate::AppResult;

use super::{Negotiated, Negotiator};

#[derive(Debug, Deserialize)]
pub(crate) struct OfferRequest {
    session_id: String,
    offer: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn submit_offer(
    State(negotiator): State<Arc<Negotiator>>,
    body: Result<Json<OfferRequest>, JsonRejection>,
) -> AppResult<Json<Negotiated>> {
    let Json(OfferRequest { session_id, offer }) = body?;
    Ok(Json(negotiator.submit_offer(&session_id, &offer).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SignalRequest {
    session_id: String,
    message: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn relay_signal(
    State(negotiator): State<Arc<Negotiator>>,
    body: Result<Json<SignalRequest>, JsonRejection>,
) -> AppResult<StatusCode> {
    let Json(SignalRequest { session_id, message }) = body?;
    negotiator.relay_signal(&session_id, &message).await?;
    Ok(StatusCode::ACCEPTED)
}
