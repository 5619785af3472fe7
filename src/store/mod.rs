//! Key/value primitives backing sessions, rooms and chat history.
//!
//! The trait mirrors the small command set the service needs from an
//! ephemeral store (`SET`/`GET`/`EXISTS`/`EXPIRE`, hashes and lists).
//! Every operation is atomic per key; nothing spans keys.

mod memory;
mod sqlite;

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{clock::Clock, config::StoreBackend, error::RelayResult};

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round trip to the backing store.
    async fn ping(&self) -> RelayResult<()>;

    /// Set a string value, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RelayResult<()>;

    async fn get(&self, key: &str) -> RelayResult<Option<String>>;

    async fn exists(&self, key: &str) -> RelayResult<bool>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> RelayResult<bool>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> RelayResult<bool>;

    /// Set hash fields. Creates the key without expiry when absent; keeps the
    /// expiry of an existing key.
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> RelayResult<()>;

    /// Replace `key` with a hash of `fields` expiring after `ttl`, in one
    /// step: the key is never visible without its expiry.
    async fn hset_ex(&self, key: &str, fields: &[(&str, &str)], ttl: Duration) -> RelayResult<()>;

    async fn hdel(&self, key: &str, field: &str) -> RelayResult<bool>;

    /// Empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> RelayResult<HashMap<String, String>>;

    /// Push to the head of a list, returning the new length.
    async fn lpush(&self, key: &str, value: &str) -> RelayResult<usize>;

    /// `lpush` followed by a trim to the first `limit` entries, applied
    /// together. Returns the length after the trim.
    async fn lpush_capped(&self, key: &str, value: &str, limit: usize) -> RelayResult<usize>;

    /// Keep only the inclusive range `start..=stop` of a list.
    async fn ltrim(&self, key: &str, start: usize, stop: usize) -> RelayResult<()>;

    /// Inclusive range `start..=stop`, head first. Empty when absent.
    async fn lrange(&self, key: &str, start: usize, stop: usize) -> RelayResult<Vec<String>>;

    /// Drop every expired key, returning how many went.
    async fn sweep(&self) -> RelayResult<usize>;
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Open the configured backend.
pub async fn connect(backend: &StoreBackend, clock: Arc<dyn Clock>) -> RelayResult<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryKv::new(clock)),
        StoreBackend::Sqlite(url) => Arc::new(SqliteKv::connect(url, clock).await?),
    };
    store.ping().await?;
    spawn_sweeper(&store, SWEEP_INTERVAL);
    Ok(store)
}

/// Sweep `store` every `period` until it is dropped.
pub fn spawn_sweeper(store: &Arc<dyn KvStore>, period: Duration) {
    let store: Weak<dyn KvStore> = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            match store.sweep().await {
                Ok(0) => {}
                Ok(dropped) => debug!(dropped, "swept expired keys"),
                Err(err) => warn!(%err, "sweep failed"),
            }
        }
    });
}

pub(crate) fn ttl_deadline(clock: &dyn Clock, ttl: Duration) -> time::OffsetDateTime {
    clock.now() + ttl
}

/// Shared contract tests, run against every backend.
#[cfg(test)]
pub(crate) mod contract {
    use std::{sync::Arc, time::Duration};

    use super::KvStore;
    use crate::clock::ManualClock;

    pub async fn strings(store: &dyn KvStore) {
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(!store.exists("a").await.unwrap());

        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.exists("a").await.unwrap());

        store.set("a", "2", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));

        assert!(store.del("a").await.unwrap());
        assert!(!store.del("a").await.unwrap());
        assert!(!store.exists("a").await.unwrap());
    }

    pub async fn expiry(store: &dyn KvStore, clock: Arc<ManualClock>) {
        store.set("short", "x", Some(Duration::from_secs(10))).await.unwrap();
        store.set("forever", "y", None).await.unwrap();
        clock.advance(time::Duration::seconds(9));
        assert!(store.exists("short").await.unwrap());

        clock.advance(time::Duration::seconds(2));
        assert!(!store.exists("short").await.unwrap());
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.exists("forever").await.unwrap());

        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
        assert!(store.expire("forever", Duration::from_secs(1)).await.unwrap());
        clock.advance(time::Duration::seconds(2));
        assert!(!store.exists("forever").await.unwrap());
    }

    pub async fn hashes(store: &dyn KvStore, clock: Arc<ManualClock>) {
        assert!(store.hgetall("h").await.unwrap().is_empty());

        store.hset("h", &[("a", "1"), ("b", "2")]).await.unwrap();
        store.hset("h", &[("b", "3")]).await.unwrap();
        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"], "3");

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());

        // hset keeps an existing expiry
        store.expire("h", Duration::from_secs(5)).await.unwrap();
        clock.advance(time::Duration::seconds(3));
        store.hset("h", &[("c", "4")]).await.unwrap();
        clock.advance(time::Duration::seconds(3));
        assert!(!store.exists("h").await.unwrap());
        assert!(store.hgetall("h").await.unwrap().is_empty());
    }

    pub async fn expiring_hashes(store: &dyn KvStore, clock: Arc<ManualClock>) {
        store.hset("r", &[("stale", "1")]).await.unwrap();
        store.hset_ex("r", &[("created_at", "now")], Duration::from_secs(10)).await.unwrap();
        let all = store.hgetall("r").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["created_at"], "now");

        clock.advance(time::Duration::seconds(11));
        assert!(!store.exists("r").await.unwrap());
    }

    pub async fn capped_lists(store: &dyn KvStore) {
        for i in 0..5 {
            let len = store.lpush_capped("c", &i.to_string(), 3).await.unwrap();
            assert_eq!(len, (i + 1).min(3));
        }
        assert_eq!(store.lrange("c", 0, 100).await.unwrap(), vec!["4", "3", "2"]);
    }

    pub async fn sweeping(store: &dyn KvStore, clock: Arc<ManualClock>) {
        store.set("s", "1", Some(Duration::from_secs(1))).await.unwrap();
        store.hset_ex("h", &[("a", "1")], Duration::from_secs(1)).await.unwrap();
        store.lpush("l", "x").await.unwrap();
        store.expire("l", Duration::from_secs(1)).await.unwrap();
        store.set("keep", "1", None).await.unwrap();

        assert_eq!(store.sweep().await.unwrap(), 0);
        clock.advance(time::Duration::seconds(2));
        assert_eq!(store.sweep().await.unwrap(), 3);
        assert!(store.exists("keep").await.unwrap());
        assert!(store.hgetall("h").await.unwrap().is_empty());
    }

    pub async fn lists(store: &dyn KvStore) {
        assert!(store.lrange("l", 0, 10).await.unwrap().is_empty());

        for i in 0..5 {
            let len = store.lpush("l", &i.to_string()).await.unwrap();
            assert_eq!(len, i + 1);
        }
        assert_eq!(store.lrange("l", 0, 1).await.unwrap(), vec!["4", "3"]);

        store.ltrim("l", 0, 2).await.unwrap();
        assert_eq!(store.lrange("l", 0, 100).await.unwrap(), vec!["4", "3", "2"]);

        store.lpush("l", "5").await.unwrap();
        assert_eq!(store.lrange("l", 1, 2).await.unwrap(), vec!["4", "3"]);
        assert!(store.lrange("l", 10, 20).await.unwrap().is_empty());
    }
}
