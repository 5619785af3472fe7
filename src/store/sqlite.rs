use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{
    Sqlite, SqliteConnection, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tokio::sync::{Mutex, MutexGuard};

use super::{KvStore, ttl_deadline};
use crate::{
    clock::Clock,
    error::{RelayError, RelayResult},
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS kv_keys (
        key TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        value TEXT,
        expires_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS kv_hash (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (key, field)
    )",
    "CREATE TABLE IF NOT EXISTS kv_list (
        key TEXT NOT NULL,
        pos INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (key, pos)
    )",
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const STRING: &str = "string";
const HASH: &str = "hash";
const LIST: &str = "list";

fn millis(at: time::OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn as_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn wrong_type(key: &str) -> RelayError {
    RelayError::InvalidInput(format!("key `{key}` holds a different kind of value"))
}

/// Store backed by SQLite through `sqlx`. Expiry timestamps are unix millis
/// taken from the injected clock.
///
/// Write transactions read before they write, and SQLite cannot upgrade a
/// deferred transaction's lock while another writer holds it, so writers
/// take `writes` first. Readers never wait on it.
pub struct SqliteKv {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    writes: Mutex<()>,
}

impl SqliteKv {
    pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> RelayResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        // every connection to `:memory:` is its own database
        let max_connections = if in_memory { 1 } else { 16 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, clock).await
    }

    pub async fn with_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> RelayResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            clock,
            writes: Mutex::new(()),
        })
    }

    async fn begin_write(&self) -> RelayResult<(MutexGuard<'_, ()>, Transaction<'static, Sqlite>)> {
        let guard = self.writes.lock().await;
        let tx = self.pool.begin().await?;
        Ok((guard, tx))
    }

    fn now(&self) -> i64 {
        millis(self.clock.now())
    }

    /// Kind of the live key, if any.
    async fn live_kind(&self, conn: &mut SqliteConnection, key: &str) -> RelayResult<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT kind FROM kv_keys WHERE key=? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(self.now())
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Drop the key if it has expired, so writes start from a clean slate.
    async fn purge_expired(&self, conn: &mut SqliteConnection, key: &str) -> RelayResult<()> {
        let expired: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM kv_keys WHERE key=? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(key)
        .bind(self.now())
        .fetch_optional(&mut *conn)
        .await?;
        if expired.is_some() {
            delete_key(conn, key).await?;
        }
        Ok(())
    }

    /// Ensure a live key of `kind` exists, creating it without expiry.
    async fn ensure_kind(&self, conn: &mut SqliteConnection, key: &str, kind: &str) -> RelayResult<()> {
        self.purge_expired(conn, key).await?;
        match self.live_kind(conn, key).await? {
            None => {
                sqlx::query("INSERT INTO kv_keys (key,kind,value,expires_at) VALUES (?,?,NULL,NULL)")
                    .bind(key)
                    .bind(kind)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
            Some(existing) if existing == kind => Ok(()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

/// Push to the head of a list that already exists as a list.
async fn push_front(conn: &mut SqliteConnection, key: &str, value: &str) -> RelayResult<()> {
    let head: i64 = sqlx::query_scalar("SELECT COALESCE(MIN(pos), 0) FROM kv_list WHERE key=?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO kv_list (key,pos,value) VALUES (?,?,?)")
        .bind(key)
        .bind(head - 1)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn list_len(conn: &mut SqliteConnection, key: &str) -> RelayResult<usize> {
    let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_list WHERE key=?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    Ok(usize::try_from(len).unwrap_or_default())
}

/// Keep `keep` entries starting `skip` from the head.
async fn trim_list(conn: &mut SqliteConnection, key: &str, skip: usize, keep: usize) -> RelayResult<()> {
    sqlx::query(
        "DELETE FROM kv_list WHERE key=? AND pos NOT IN
         (SELECT pos FROM kv_list WHERE key=? ORDER BY pos LIMIT ? OFFSET ?)",
    )
    .bind(key)
    .bind(key)
    .bind(as_i64(keep))
    .bind(as_i64(skip))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_key(conn: &mut SqliteConnection, key: &str) -> RelayResult<bool> {
    sqlx::query("DELETE FROM kv_hash WHERE key=?").bind(key).execute(&mut *conn).await?;
    sqlx::query("DELETE FROM kv_list WHERE key=?").bind(key).execute(&mut *conn).await?;
    let removed = sqlx::query("DELETE FROM kv_keys WHERE key=?")
        .bind(key)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(removed > 0)
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn ping(&self) -> RelayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RelayResult<()> {
        let expires_at = ttl.map(|ttl| millis(ttl_deadline(self.clock.as_ref(), ttl)));
        let (_write, mut tx) = self.begin_write().await?;
        delete_key(&mut tx, key).await?;
        sqlx::query("INSERT INTO kv_keys (key,kind,value,expires_at) VALUES (?,?,?,?)")
            .bind(key)
            .bind(STRING)
            .bind(value)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT kind,value FROM kv_keys WHERE key=? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some((kind, value)) if kind == STRING => Ok(value),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &str) -> RelayResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(self.live_kind(&mut conn, key).await?.is_some())
    }

    async fn del(&self, key: &str) -> RelayResult<bool> {
        let (_write, mut tx) = self.begin_write().await?;
        let live = self.live_kind(&mut tx, key).await?.is_some();
        delete_key(&mut tx, key).await?;
        tx.commit().await?;
        Ok(live)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RelayResult<bool> {
        let expires_at = millis(ttl_deadline(self.clock.as_ref(), ttl));
        let _write = self.writes.lock().await;
        let updated = sqlx::query(
            "UPDATE kv_keys SET expires_at=? WHERE key=? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(expires_at)
        .bind(key)
        .bind(self.now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> RelayResult<()> {
        let (_write, mut tx) = self.begin_write().await?;
        self.ensure_kind(&mut tx, key, HASH).await?;
        for (field, value) in fields {
            sqlx::query(
                "INSERT INTO kv_hash (key,field,value) VALUES (?,?,?)
                 ON CONFLICT(key,field) DO UPDATE SET value=excluded.value",
            )
            .bind(key)
            .bind(*field)
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn hset_ex(&self, key: &str, fields: &[(&str, &str)], ttl: Duration) -> RelayResult<()> {
        let expires_at = millis(ttl_deadline(self.clock.as_ref(), ttl));
        let (_write, mut tx) = self.begin_write().await?;
        delete_key(&mut tx, key).await?;
        sqlx::query("INSERT INTO kv_keys (key,kind,value,expires_at) VALUES (?,?,NULL,?)")
            .bind(key)
            .bind(HASH)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        for (field, value) in fields {
            sqlx::query("INSERT INTO kv_hash (key,field,value) VALUES (?,?,?)")
                .bind(key)
                .bind(*field)
                .bind(*value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> RelayResult<bool> {
        let (_write, mut tx) = self.begin_write().await?;
        let removed = match self.live_kind(&mut tx, key).await?.as_deref() {
            None => false,
            Some(HASH) => {
                sqlx::query("DELETE FROM kv_hash WHERE key=? AND field=?")
                    .bind(key)
                    .bind(field)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                    > 0
            }
            Some(_) => return Err(wrong_type(key)),
        };
        tx.commit().await?;
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> RelayResult<HashMap<String, String>> {
        let mut conn = self.pool.acquire().await?;
        match self.live_kind(&mut conn, key).await?.as_deref() {
            None => Ok(HashMap::new()),
            Some(HASH) => {
                let rows: Vec<(String, String)> =
                    sqlx::query_as("SELECT field,value FROM kv_hash WHERE key=?")
                        .bind(key)
                        .fetch_all(&mut *conn)
                        .await?;
                Ok(rows.into_iter().collect())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> RelayResult<usize> {
        let (_write, mut tx) = self.begin_write().await?;
        self.ensure_kind(&mut tx, key, LIST).await?;
        push_front(&mut tx, key, value).await?;
        let len = list_len(&mut tx, key).await?;
        tx.commit().await?;
        Ok(len)
    }

    async fn lpush_capped(&self, key: &str, value: &str, limit: usize) -> RelayResult<usize> {
        let (_write, mut tx) = self.begin_write().await?;
        self.ensure_kind(&mut tx, key, LIST).await?;
        push_front(&mut tx, key, value).await?;
        trim_list(&mut tx, key, 0, limit).await?;
        let len = list_len(&mut tx, key).await?;
        tx.commit().await?;
        Ok(len)
    }

    async fn ltrim(&self, key: &str, start: usize, stop: usize) -> RelayResult<()> {
        let (_write, mut tx) = self.begin_write().await?;
        match self.live_kind(&mut tx, key).await?.as_deref() {
            None => return Ok(()),
            Some(LIST) => {}
            Some(_) => return Err(wrong_type(key)),
        }
        let keep = if start > stop { 0 } else { (stop - start).saturating_add(1) };
        trim_list(&mut tx, key, start, keep).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: usize, stop: usize) -> RelayResult<Vec<String>> {
        if start > stop {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.acquire().await?;
        match self.live_kind(&mut conn, key).await?.as_deref() {
            None => Ok(Vec::new()),
            Some(LIST) => Ok(sqlx::query_scalar(
                "SELECT value FROM kv_list WHERE key=? ORDER BY pos LIMIT ? OFFSET ?",
            )
            .bind(key)
            .bind(as_i64((stop - start).saturating_add(1)))
            .bind(as_i64(start))
            .fetch_all(&mut *conn)
            .await?),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sweep(&self) -> RelayResult<usize> {
        let now = self.now();
        let (_write, mut tx) = self.begin_write().await?;
        for statement in [
            "DELETE FROM kv_hash WHERE key IN
             (SELECT key FROM kv_keys WHERE expires_at IS NOT NULL AND expires_at <= ?)",
            "DELETE FROM kv_list WHERE key IN
             (SELECT key FROM kv_keys WHERE expires_at IS NOT NULL AND expires_at <= ?)",
        ] {
            sqlx::query(statement).bind(now).execute(&mut *tx).await?;
        }
        let dropped = sqlx::query("DELETE FROM kv_keys WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(usize::try_from(dropped).unwrap_or(usize::MAX))
    }
}
