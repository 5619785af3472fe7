mod common;

use std::{sync::Arc, time::Duration};

use common::{OFFER, harness, harness_with_store};
use signalrelay::{
    chat::Chat,
    clock::ManualClock,
    config::Config,
    error::RelayError,
    negotiation::{DeliveryMode, PeerState, SignalMessage},
    relay::{Delivery, Topic},
    sessions::SessionStatus,
    store::SqliteKv,
};

#[tokio::test]
async fn offer_on_a_fresh_session_is_established() {
    let h = harness(Config::default());
    let id = h.state.sessions.create_session().await.unwrap();

    let negotiated = h.state.negotiator.submit_offer(&id, OFFER).await.unwrap();
    assert_eq!(negotiated.state, PeerState::Established);
    let answer = negotiated.answer.unwrap();
    assert!(!answer.is_empty());
    assert!(answer.contains("m=audio"));

    let session = h.state.sessions.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn offer_for_a_missing_session_has_no_side_effects() {
    let h = harness(Config::default());
    assert!(matches!(
        h.state.negotiator.submit_offer("nonexistent", OFFER).await,
        Err(RelayError::NotFound(_))
    ));
    assert_eq!(h.state.negotiator.live_count(), 0);
    assert!(!h.state.sessions.session_exists("nonexistent").await.unwrap());
}

#[tokio::test]
async fn relayed_answer_reaches_a_session_subscriber() {
    let h = harness(Config {
        delivery_mode: DeliveryMode::Relay,
        ..Config::default()
    });
    let id = h.state.sessions.create_session().await.unwrap();
    let mut sub = h.state.relay.subscribe(&Topic::session(&id)).await.unwrap();

    let negotiated = h.state.negotiator.submit_offer(&id, OFFER).await.unwrap();
    assert!(negotiated.relayed);

    let delivery = sub.recv().await.unwrap();
    assert_eq!(delivery.content_type.as_str(), "application/json");
    let signal: SignalMessage = serde_json::from_str(&delivery.body).unwrap();
    assert!(matches!(signal, SignalMessage::Answer { .. }));
}

#[tokio::test]
async fn sent_chat_is_the_most_recent_history_entry() {
    let h = harness(Config::default());
    h.state.chat.send("bob", "room1", "earlier").await.unwrap();
    h.state.chat.send("alice", "room1", "hi").await.unwrap();

    let history = h.state.chat.history("room1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].username, "alice");
    assert_eq!(history[0].content, "hi");
    assert_eq!(history[0].room, "room1");
}

#[tokio::test]
async fn history_keeps_the_fifty_newest() {
    let h = harness(Config::default());
    for i in 0..75 {
        h.state.chat.send("alice", "busy", &format!("msg {i}")).await.unwrap();
    }

    let history = h.state.chat.history("busy").await.unwrap();
    assert_eq!(history.len(), 50);
    let expected: Vec<String> = (25..75).rev().map(|i| format!("msg {i}")).collect();
    let got: Vec<String> = history.into_iter().map(|m| m.content).collect();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn untouched_room_expires_after_a_day() {
    let h = harness(Config::default());
    let room = h.state.sessions.create_room().await.unwrap();
    h.state.sessions.join_room(&room.id, "peer-a").await.unwrap();

    h.clock.advance(time::Duration::hours(23));
    assert!(h.state.sessions.get_room(&room.id).await.is_ok());

    h.clock.advance(time::Duration::hours(2));
    assert!(matches!(
        h.state.sessions.get_room(&room.id).await,
        Err(RelayError::NotFound(_))
    ));
    assert!(matches!(
        h.state.sessions.join_room(&room.id, "peer-b").await,
        Err(RelayError::NotFound(_))
    ));
}

#[tokio::test]
async fn unsubscribed_queue_gets_nothing() {
    let h = harness(Config::default());
    let topic = Topic::chat("room1");
    let mut stays = h.state.relay.subscribe(&topic).await.unwrap();
    let leaves = h.state.relay.subscribe(&topic).await.unwrap();
    let gone = leaves.queue().clone();

    h.state.relay.unsubscribe(leaves);
    assert!(!h.broker.has_queue(&gone));
    assert_eq!(h.broker.queue_count(&topic), 1);

    h.state.relay.publish(&topic, Delivery::text("after")).await.unwrap();
    assert_eq!(stays.recv().await.unwrap().body, "after");
}

#[tokio::test]
async fn sessions_and_history_on_sqlite() {
    let clock = Arc::new(ManualClock::default());
    let kv = Arc::new(SqliteKv::connect("sqlite::memory:", clock.clone()).await.unwrap());
    let h = harness_with_store(
        Config {
            session_ttl: Some(Duration::from_secs(60)),
            ..Config::default()
        },
        kv,
        clock,
    );

    let id = h.state.sessions.create_session().await.unwrap();
    h.state.negotiator.submit_offer(&id, OFFER).await.unwrap();
    h.state.chat.send("alice", "room1", "hi").await.unwrap();
    assert_eq!(h.state.chat.history("room1").await.unwrap()[0].content, "hi");

    h.clock.advance(time::Duration::seconds(61));
    assert!(!h.state.sessions.session_exists(&id).await.unwrap());
}

async fn send_concurrently(chat: &Arc<Chat>, room: &str, count: usize) -> Vec<RelayError> {
    let sends: Vec<_> = (0..count)
        .map(|i| {
            let chat = chat.clone();
            let room = room.to_owned();
            tokio::spawn(async move { chat.send("alice", &room, &format!("msg {i}")).await })
        })
        .collect();
    let mut failures = Vec::new();
    for send in sends {
        if let Err(err) = send.await.unwrap() {
            failures.push(err);
        }
    }
    failures
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_keep_history_at_its_limit() {
    let h = harness(Config::default());
    let failures = send_concurrently(&h.state.chat, "busy", 120).await;
    assert!(failures.is_empty(), "{failures:?}");
    assert_eq!(h.state.chat.history("busy").await.unwrap().len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_on_a_sqlite_file() {
    let path = std::env::temp_dir().join(format!("signalrelay-chat-{}.db", uuid::Uuid::now_v7().simple()));
    let clock = Arc::new(ManualClock::default());
    let kv = Arc::new(
        SqliteKv::connect(&format!("sqlite://{}", path.display()), clock.clone())
            .await
            .unwrap(),
    );
    let h = harness_with_store(Config::default(), kv, clock);

    let failures = send_concurrently(&h.state.chat, "busy", 64).await;
    let history = h.state.chat.history("busy").await;
    drop(h);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }

    assert!(failures.is_empty(), "{failures:?}");
    assert_eq!(history.unwrap().len(), 50);
}
