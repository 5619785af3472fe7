mod common;

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use common::{OFFER, harness};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use signalrelay::{app, config::Config};
use tower::ServiceExt;

fn router() -> Router {
    let h = harness(Config::default());
    app(h.state, Duration::from_secs(5))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

#[tokio::test]
async fn health() {
    let app = router();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn session_lifecycle() {
    let app = router();
    let (status, body) = call(&app, Method::POST, "/start-session", None).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["session_id"].as_str().unwrap().to_owned();
    assert!(id.starts_with("session_"));

    let (status, body) = call(&app, Method::GET, &format!("/session/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");

    let (status, body) = call(
        &app,
        Method::POST,
        "/offer",
        Some(json!({ "session_id": id, "offer": OFFER })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "established");
    assert!(body["answer"].as_str().unwrap().starts_with("v=0"));

    let (status, body) = call(&app, Method::POST, &format!("/session/{id}/close"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");

    let (status, body) = call(
        &app,
        Method::POST,
        "/offer",
        Some(json!({ "session_id": id, "offer": OFFER })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn offer_errors_map_to_status_codes() {
    let app = router();
    let (status, body) = call(
        &app,
        Method::POST,
        "/offer",
        Some(json!({ "session_id": "session_nope", "offer": OFFER })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, body) = call(&app, Method::POST, "/offer", Some(json!({ "offer": OFFER }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");

    let (_, body) = call(&app, Method::POST, "/start-session", None).await;
    let id = body["session_id"].as_str().unwrap();
    let (status, body) = call(
        &app,
        Method::POST,
        "/offer",
        Some(json!({ "session_id": id, "offer": "not sdp" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "invalid_offer");
}

#[tokio::test]
async fn signals_need_a_session() {
    let app = router();
    let (status, _) = call(
        &app,
        Method::POST,
        "/signal",
        Some(json!({ "session_id": "session_nope", "message": "ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&app, Method::POST, "/start-session", None).await;
    let (status, _) = call(
        &app,
        Method::POST,
        "/signal",
        Some(json!({ "session_id": body["session_id"], "message": "ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn chat_and_history() {
    let app = router();
    let (status, sent) = call(
        &app,
        Method::POST,
        "/chat",
        Some(json!({ "username": "alice", "room": "room1", "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["content"], "hi");

    let (status, history) = call(&app, Method::GET, "/history?room=room1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0], sent);

    let (status, history) = call(&app, Method::GET, "/history?room=quiet", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history, json!([]));

    let (status, body) = call(&app, Method::GET, "/history", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn rooms() {
    let app = router();
    let (status, room) = call(&app, Method::POST, "/rooms", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = room["room_id"].as_str().unwrap().to_owned();

    let (status, room) = call(
        &app,
        Method::POST,
        &format!("/rooms/{id}/join"),
        Some(json!({ "peer_id": "peer-a" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room["peers"], json!(["peer-a"]));

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/rooms/{id}/leave"),
        Some(json!({ "peer_id": "peer-a" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, room) = call(&app, Method::GET, &format!("/rooms/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room["peers"], json!([]));

    let (status, _) = call(&app, Method::GET, "/rooms/room_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
