//! Redis-backed [`CommandStore`]
//!
//! Modeled on `synctv-cluster::discovery::node_registry::NodeRegistry`'s
//! cached-`MultiplexedConnection` pattern: one shared, cheaply-cloneable
//! connection reused across calls, with every round trip wrapped in a timeout
//! so a wedged Redis server degrades to errors rather than hanging callers
//! forever.

use super::CommandStore;
use crate::error::{Error, Result};
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::warn;

/// Timeout applied to every individual Redis round trip
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Batch size for cursor-based `SCAN` iteration
const SCAN_BATCH_SIZE: usize = 100;

/// A [`CommandStore`] backed by a real Redis (or Redis-compatible) server.
pub struct RedisCommandStore {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisCommandStore {
    /// Open a client for `redis_url`. Does not connect eagerly; the first
    /// command call establishes and caches the connection.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("timed out connecting to redis".to_string()))??;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next call reconnects. Used after a
    /// command fails, since a `MultiplexedConnection` does not always
    /// self-heal from every error class.
    async fn invalidate(&self) {
        self.conn.lock().await.take();
    }
}

#[async_trait::async_trait]
impl CommandStore for RedisCommandStore {
    async fn hset(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let pairs: Vec<(&String, &String)> = fields.iter().collect();
        let result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.hset_multiple::<_, _, _, ()>(key, &pairs),
        )
        .await
        .map_err(|_| Error::Timeout(format!("HSET {key} timed out")))?;
        if result.is_err() {
            self.invalidate().await;
        }
        result.map_err(Error::from)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.hgetall::<_, HashMap<String, String>>(key),
        )
        .await
        .map_err(|_| Error::Timeout(format!("HGETALL {key} timed out")))?;
        if result.is_err() {
            self.invalidate().await;
        }
        result.map_err(Error::from)
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut conn = self.conn().await?;
        let result: std::result::Result<(), redis::RedisError> = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            async {
                conn.lpush::<_, _, ()>(key, value).await?;
                conn.ltrim::<_, ()>(key, 0, cap as isize - 1).await
            },
        )
        .await
        .map_err(|_| Error::Timeout(format!("LPUSH/LTRIM {key} timed out")))?;
        if result.is_err() {
            self.invalidate().await;
        }
        result.map_err(Error::from)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.lrange::<_, Vec<String>>(key, 0, -1),
        )
        .await
        .map_err(|_| Error::Timeout(format!("LRANGE {key} timed out")))?;
        if result.is_err() {
            self.invalidate().await;
        }
        result.map_err(Error::from)
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.del::<_, ()>(keys),
        )
        .await
        .map_err(|_| Error::Timeout("DEL timed out".to_string()))?;
        if result.is_err() {
            self.invalidate().await;
        }
        result.map_err(Error::from)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish::<_, _, usize>(channel, payload),
        )
        .await
        .map_err(|_| Error::Timeout(format!("PUBLISH {channel} timed out")))?;
        if result.is_err() {
            self.invalidate().await;
        }
        result.map_err(Error::from)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let scan_result: std::result::Result<(u64, Vec<String>), redis::RedisError> = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH_SIZE)
                    .query_async(&mut conn),
            )
            .await
            .map_err(|_| Error::Timeout(format!("SCAN {pattern} timed out")))?;

            let (next_cursor, batch) = match scan_result {
                Ok(v) => v,
                Err(e) => {
                    self.invalidate().await;
                    warn!(error = %e, pattern = %pattern, "SCAN failed, aborting pattern fetch");
                    return Err(Error::from(e));
                }
            };

            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}
