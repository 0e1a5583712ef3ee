//! State store adapter.
//!
//! A thin capability over Redis providing small-record reads and writes with
//! TTL plus a per-key distributed lock. All counter mutations in this system
//! run inside the lock, so retries of individual operations are safe.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::keys;

/// Maximum number of attempts for a single read or write.
const RETRY_ATTEMPTS: u32 = 3;
/// Base backoff applied between retries, scaled by attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);
/// Poll interval while waiting on a contended lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// TTL on lock records so a crashed holder can not wedge a key forever.
pub const LOCK_TTL: Duration = Duration::from_secs(5);
/// Hard bound on waiting for a lock, kept strictly under the admission timeout.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Release a lock record only if the caller still holds it.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Errors surfaced by state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or answered with a protocol error.
    #[error("state store transport error: {0}")]
    Transport(String),
    /// The per-key lock could not be acquired within its deadline.
    #[error("timed out acquiring lock for key {0}")]
    LockTimeout(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// An opaque token proving lock ownership, required to release the lock.
#[derive(Debug)]
pub struct LockToken(pub(crate) String);

/// The capability this system needs from a shared key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under the given key, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value under the given key with the given TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete the given key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List all keys starting with the given prefix.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Round-trip a liveness probe against the store.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Acquire the lock guarding the given key, waiting at most `timeout`.
    ///
    /// The returned token must be passed back to `release_lock`; until then
    /// all other callers for the same key block or time out.
    async fn acquire_lock(&self, key: &str, timeout: Duration, ttl: Duration) -> Result<LockToken, StoreError>;

    /// Release a held lock. A lost or expired lock releases as a no-op.
    async fn release_lock(&self, key: &str, token: LockToken) -> Result<(), StoreError>;
}

/// The Redis-backed state store used in production.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at the given endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client.get_tokio_connection_manager().await.context("error connecting to state store")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut conn = self.conn.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(val) => return Ok(val),
                Err(err) if attempt < RETRY_ATTEMPTS => {
                    tracing::warn!(error = ?err, key = %key, attempt, "retrying state store read");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let ttl_seconds = ttl.as_secs().max(1) as usize;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut conn = self.conn.clone();
            match conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < RETRY_ATTEMPTS => {
                    tracing::warn!(error = ?err, key = %key, attempt, "retrying state store write");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = vec![];
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration, ttl: Duration) -> Result<LockToken, StoreError> {
        let lock_key = keys::lock(key);
        let token = format!("{:032x}", rand::thread_rng().gen::<u128>());
        let deadline = Instant::now() + timeout;
        loop {
            let mut conn = self.conn.clone();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                return Ok(LockToken(token));
            }
            if Instant::now() + LOCK_RETRY_INTERVAL >= deadline {
                return Err(StoreError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release_lock(&self, key: &str, token: LockToken) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(keys::lock(key))
            .arg(&token.0)
            .invoke_async::<_, i32>(&mut conn)
            .await?;
        Ok(())
    }
}
