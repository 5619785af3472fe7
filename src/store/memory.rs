use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use super::{KvStore, ttl_deadline};
use crate::{
    clock::Clock,
    error::{RelayError, RelayResult},
};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<OffsetDateTime>,
}

impl Entry {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> RelayError {
    RelayError::InvalidInput(format!("key `{key}` holds a different kind of value"))
}

/// In-process store. Expired keys are dropped lazily on access and by the
/// periodic sweeper.
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Run `f` on a live entry, treating an expired one as absent.
    fn with_live<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries.get(key).map(|entry| f(&entry))
    }

    fn with_live_mut<T>(&self, key: &str, f: impl FnOnce(&mut Entry) -> T) -> Option<T> {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries.get_mut(key).map(|mut entry| f(&mut entry))
    }

    /// Live entry for `key`, created with `init` (and no expiry) when absent.
    fn upsert<T>(
        &self,
        key: &str,
        init: impl Fn() -> Value,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> T {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: init(),
                expires_at: None,
            };
        }
        f(&mut entry)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RelayResult<()> {
        let expires_at = ttl.map(|ttl| ttl_deadline(self.clock.as_ref(), ttl));
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        match self.with_live(key, |entry| entry.value.clone()) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &str) -> RelayResult<bool> {
        Ok(self.with_live(key, |_| ()).is_some())
    }

    async fn del(&self, key: &str) -> RelayResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RelayResult<bool> {
        let expires_at = ttl_deadline(self.clock.as_ref(), ttl);
        Ok(self
            .with_live_mut(key, |entry| entry.expires_at = Some(expires_at))
            .is_some())
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> RelayResult<()> {
        self.upsert(
            key,
            || Value::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Hash(hash) => {
                    for (field, value) in fields {
                        hash.insert((*field).to_owned(), (*value).to_owned());
                    }
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn hset_ex(&self, key: &str, fields: &[(&str, &str)], ttl: Duration) -> RelayResult<()> {
        let hash = fields
            .iter()
            .map(|(field, value)| ((*field).to_owned(), (*value).to_owned()))
            .collect();
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Hash(hash),
                expires_at: Some(ttl_deadline(self.clock.as_ref(), ttl)),
            },
        );
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> RelayResult<bool> {
        match self.with_live_mut(key, |entry| match &mut entry.value {
            Value::Hash(hash) => Ok(hash.remove(field).is_some()),
            _ => Err(wrong_type(key)),
        }) {
            None => Ok(false),
            Some(result) => result,
        }
    }

    async fn hgetall(&self, key: &str) -> RelayResult<HashMap<String, String>> {
        match self.with_live(key, |entry| entry.value.clone()) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> RelayResult<usize> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value.to_owned());
                    Ok(list.len())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn lpush_capped(&self, key: &str, value: &str, limit: usize) -> RelayResult<usize> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value.to_owned());
                    list.truncate(limit);
                    Ok(list.len())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn ltrim(&self, key: &str, start: usize, stop: usize) -> RelayResult<()> {
        match self.with_live_mut(key, |entry| match &mut entry.value {
            Value::List(list) => {
                list.truncate(stop.saturating_add(1));
                list.drain(..start.min(list.len()));
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }) {
            None => Ok(()),
            Some(result) => result,
        }
    }

    async fn lrange(&self, key: &str, start: usize, stop: usize) -> RelayResult<Vec<String>> {
        if start > stop {
            return Ok(Vec::new());
        }
        match self.with_live(key, |entry| match &entry.value {
            Value::List(list) => Ok(list
                .iter()
                .skip(start)
                .take((stop - start).saturating_add(1))
                .cloned()
                .collect()),
            _ => Err(wrong_type(key)),
        }) {
            None => Ok(Vec::new()),
            Some(result) => result,
        }
    }

    async fn sweep(&self) -> RelayResult<usize> {
        let now = self.clock.now();
        let mut dropped = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            dropped += usize::from(expired);
            !expired
        });
        Ok(dropped)
    }
}
