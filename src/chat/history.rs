use std::sync::Arc;

use tracing::warn;

use crate::{error::RelayResult, store::KvStore};

use super::ChatMessage;

/// Bounded per-room backlog, newest first.
///
/// Appends are not coordinated with the relay: a message may be fanned out
/// before or after it lands here.
pub struct HistoryLog {
    kv: Arc<dyn KvStore>,
    limit: usize,
}

fn key(room: &str) -> String {
    format!("chat_history_{room}")
}

impl HistoryLog {
    pub fn new(kv: Arc<dyn KvStore>, limit: usize) -> Self {
        Self {
            kv,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Push to the front and trim to the newest `limit` entries in one step.
    pub async fn append(&self, message: &ChatMessage) -> RelayResult<()> {
        let body = serde_json::to_string(message)?;
        self.kv.lpush_capped(&key(&message.room), &body, self.limit).await?;
        Ok(())
    }

    pub async fn recent(&self, room: &str) -> RelayResult<Vec<ChatMessage>> {
        let entries = self.kv.lrange(&key(room), 0, self.limit - 1).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                serde_json::from_str::<ChatMessage>(entry)
                    .inspect_err(|err| warn!(room, %err, "skipping unreadable history entry"))
                    .ok()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::{clock::ManualClock, store::MemoryKv};

    fn message(room: &str, content: &str) -> ChatMessage {
        ChatMessage {
            username: "alice".into(),
            content: content.into(),
            room: room.into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn log(limit: usize) -> (HistoryLog, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new(Arc::new(ManualClock::default())));
        (HistoryLog::new(kv.clone(), limit), kv)
    }

    #[tokio::test]
    async fn keeps_only_the_newest_entries() {
        let (log, _) = log(3);
        for i in 0..5 {
            log.append(&message("r", &i.to_string())).await.unwrap();
        }
        let contents: Vec<_> = log
            .recent("r")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn unknown_room_is_empty() {
        let (log, _) = log(50);
        assert!(log.recent("nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rooms_do_not_share_history() {
        let (log, _) = log(50);
        log.append(&message("a", "for a")).await.unwrap();
        log.append(&message("b", "for b")).await.unwrap();
        let a = log.recent("a").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].content, "for a");
    }

    #[tokio::test]
    async fn unreadable_entries_are_skipped() {
        let (log, kv) = log(50);
        log.append(&message("r", "ok")).await.unwrap();
        kv.lpush("chat_history_r", "{not json").await.unwrap();
        let recent = log.recent("r").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "ok");
    }

    #[test]
    fn zero_limit_is_clamped() {
        let (log, _) = log(0);
        assert_eq!(log.limit(), 1);
    }
}
