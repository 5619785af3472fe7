//! Per-connection task layout shared by every socket endpoint.
//!
//! A connection runs three pieces:
//! - the reader (the caller's task), which handles inbound frames one at a
//!   time,
//! - a writer task, the only thing that ever writes to the socket, fed by a
//!   bounded queue,
//! - a pump task running the subscription's consumption loop into that
//!   queue.
//!
//! When the reader stops (close frame, read error, or the writer/pump
//! ending), the pump is aborted, which drops the subscription and releases
//! its queue, and the writer is given a moment to flush. Both tasks are
//! held in abort-on-drop guards, so unwinding out of the reader cleans up
//! the same way.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::{RelayError, RelayResult},
    relay::Subscription,
    task::AbortOnDrop,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles inbound text frames for one connection.
#[async_trait]
pub trait FrameHandler: Send {
    /// An optional reply, written back through the connection's writer.
    async fn on_text(&mut self, text: String) -> Option<String>;
}

/// Text frame reporting a failed inbound frame to its sender.
pub fn error_frame(err: &RelayError) -> String {
    json!({
        "type": "error",
        "kind": err.kind(),
        "message": err.to_string(),
    })
    .to_string()
}

pub async fn drive<W, R, WE, RE>(
    sink: W,
    mut stream: R,
    subscription: Subscription,
    mut frames: impl FrameHandler,
    capacity: usize,
) where
    W: Sink<Message, Error = WE> + Unpin + Send + 'static,
    WE: Display + Send + 'static,
    R: Stream<Item = Result<Message, RE>> + Unpin + Send,
    RE: Display + Send,
{
    let topic = subscription.topic().clone();
    let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));
    let mut writer = AbortOnDrop::spawn(write_loop(sink, outbound_rx));
    let mut consumer = AbortOnDrop::spawn(pump(subscription, outbound.clone()));

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = frames.on_text(text.as_str().to_owned()).await else {
                        continue;
                    };
                    if outbound.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%topic, %err, "read failed");
                    break;
                }
            },
            result = &mut writer => {
                if let Ok(Err(err)) = result {
                    debug!(%topic, %err, "writer stopped");
                }
                return;
            }
            _ = &mut consumer => {
                debug!(%topic, "subscription ended");
                break;
            }
        }
    }

    drop(consumer);
    drop(outbound);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        warn!(%topic, "writer did not flush in time");
    }
    debug!(%topic, "connection closed");
}

async fn write_loop<W, WE>(mut sink: W, mut outbound: mpsc::Receiver<Message>) -> RelayResult<()>
where
    W: Sink<Message, Error = WE> + Unpin,
    WE: Display,
{
    while let Some(message) = outbound.recv().await {
        sink.send(message)
            .await
            .map_err(|err| RelayError::TransportUnavailable(err.to_string()))?;
    }
    let _ = sink.close().await;
    Ok(())
}

async fn pump(mut subscription: Subscription, outbound: mpsc::Sender<Message>) {
    while let Some(delivery) = subscription.recv().await {
        if outbound.send(Message::Text(delivery.body.into())).await.is_err() {
            break;
        }
    }
}
