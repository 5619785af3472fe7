use std::{collections::BTreeSet, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{RelayError, RelayResult},
    store::KvStore,
};

const CREATED_AT: &str = "created_at";
const PEER_PREFIX: &str = "peer:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "session_id")]
    pub id: String,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Value stored under the session key.
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Room {
    #[serde(rename = "room_id")]
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub peers: BTreeSet<String>,
}

/// Session and room records over a [`KvStore`].
///
/// Sessions live until closed (or until the configured TTL, counted from
/// creation). Rooms always expire a fixed TTL after creation; joins and
/// leaves never extend it.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    session_ttl: Option<Duration>,
    room_ttl: Duration,
}

impl SessionStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        session_ttl: Option<Duration>,
        room_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            clock,
            session_ttl,
            room_ttl,
        }
    }

    #[instrument(skip(self))]
    pub async fn create_session(&self) -> RelayResult<String> {
        let id = format!("session_{}", Uuid::now_v7().simple());
        let record = SessionRecord {
            status: SessionStatus::Active,
            created_at: self.clock.now(),
        };
        self.kv
            .set(&id, &serde_json::to_string(&record)?, self.session_ttl)
            .await?;
        info!(session_id = %id, "session created");
        Ok(id)
    }

    /// Best-effort gate: the session may still expire right after this
    /// returns `true`.
    pub async fn session_exists(&self, id: &str) -> RelayResult<bool> {
        if !id.starts_with("session_") {
            return Ok(false);
        }
        self.kv.exists(id).await
    }

    pub async fn get_session(&self, id: &str) -> RelayResult<Session> {
        let not_found = || RelayError::NotFound(format!("session {id}"));
        if !id.starts_with("session_") {
            return Err(not_found());
        }
        let raw = self.kv.get(id).await?.ok_or_else(not_found)?;
        let record: SessionRecord = serde_json::from_str(&raw)
            .map_err(|err| RelayError::StoreUnavailable(format!("corrupt session {id}: {err}")))?;
        Ok(Session {
            id: id.to_owned(),
            status: record.status,
            created_at: record.created_at,
        })
    }

    pub async fn get_session_status(&self, id: &str) -> RelayResult<SessionStatus> {
        Ok(self.get_session(id).await?.status)
    }

    /// Active -> Closed. Closing a closed session is a no-op.
    #[instrument(skip(self))]
    pub async fn close_session(&self, id: &str) -> RelayResult<Session> {
        let mut session = self.get_session(id).await?;
        if session.status == SessionStatus::Closed {
            return Ok(session);
        }

        // SET drops the expiry, so carry over what is left of it
        let ttl = match self.session_ttl {
            None => None,
            Some(ttl) => {
                let elapsed = self.clock.now() - session.created_at;
                let remaining = time::Duration::try_from(ttl)
                    .map(|ttl| ttl - elapsed)
                    .ok()
                    .and_then(|left| Duration::try_from(left).ok())
                    .filter(|left| !left.is_zero());
                match remaining {
                    Some(left) => Some(left),
                    None => return Err(RelayError::NotFound(format!("session {id}"))),
                }
            }
        };

        session.status = SessionStatus::Closed;
        let record = SessionRecord {
            status: session.status,
            created_at: session.created_at,
        };
        self.kv.set(id, &serde_json::to_string(&record)?, ttl).await?;
        info!(session_id = %id, "session closed");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn create_room(&self) -> RelayResult<Room> {
        let id = format!("room_{}", Uuid::now_v7().simple());
        let created_at = self.clock.now();
        let stamp = created_at
            .format(&Rfc3339)
            .map_err(|err| RelayError::InvalidInput(err.to_string()))?;
        self.kv
            .hset_ex(&id, &[(CREATED_AT, stamp.as_str())], self.room_ttl)
            .await?;
        info!(room_id = %id, ttl_secs = self.room_ttl.as_secs(), "room created");
        Ok(Room {
            id,
            created_at,
            peers: BTreeSet::new(),
        })
    }

    pub async fn room_exists(&self, id: &str) -> RelayResult<bool> {
        if !id.starts_with("room_") {
            return Ok(false);
        }
        self.kv.exists(id).await
    }

    pub async fn get_room(&self, id: &str) -> RelayResult<Room> {
        if !id.starts_with("room_") {
            return Err(RelayError::NotFound(format!("room {id}")));
        }
        let fields = self.kv.hgetall(id).await?;
        let created_at = fields
            .get(CREATED_AT)
            .ok_or_else(|| RelayError::NotFound(format!("room {id}")))?;
        let created_at = OffsetDateTime::parse(created_at, &Rfc3339)
            .map_err(|err| RelayError::StoreUnavailable(format!("corrupt room {id}: {err}")))?;
        let peers = fields
            .keys()
            .filter_map(|field| field.strip_prefix(PEER_PREFIX))
            .map(str::to_owned)
            .collect();
        Ok(Room {
            id: id.to_owned(),
            created_at,
            peers,
        })
    }

    #[instrument(skip(self))]
    pub async fn join_room(&self, id: &str, peer_id: &str) -> RelayResult<Room> {
        let peer_id = validate_peer(peer_id)?;
        if !self.room_exists(id).await? {
            return Err(RelayError::NotFound(format!("room {id}")));
        }
        let field = format!("{PEER_PREFIX}{peer_id}");
        self.kv.hset(id, &[(field.as_str(), "1")]).await?;

        // the room can expire between the check and the write; the write
        // then recreates a record without `created_at` that must not linger
        match self.get_room(id).await {
            Err(RelayError::NotFound(what)) => {
                self.kv.del(id).await?;
                Err(RelayError::NotFound(what))
            }
            other => {
                debug!(room_id = %id, peer_id, "peer joined");
                other
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn leave_room(&self, id: &str, peer_id: &str) -> RelayResult<()> {
        let peer_id = validate_peer(peer_id)?;
        if !self.room_exists(id).await? {
            return Err(RelayError::NotFound(format!("room {id}")));
        }
        self.kv.hdel(id, &format!("{PEER_PREFIX}{peer_id}")).await?;
        debug!(room_id = %id, peer_id, "peer left");
        Ok(())
    }
}

fn validate_peer(peer_id: &str) -> RelayResult<&str> {
    let peer_id = peer_id.trim();
    if peer_id.is_empty() {
        return Err(RelayError::InvalidInput("peer_id must not be empty".into()));
    }
    Ok(peer_id)
}
