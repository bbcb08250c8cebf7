//! Redis shared-store backend.
//!
//! Uses `ConnectionManager` for automatic reconnection and cursor-based
//! `SCAN` iteration (never `KEYS`, which blocks the server).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::error::Result;
use crate::traits::RemoteStore;

/// Redis-backed `RemoteStore` with automatic reconnection.
pub struct RedisStore {
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// Connect using `REDIS_URL` or the localhost default.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created or the initial PING
    /// fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url).await
    }

    /// Connect to a specific Redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created or the initial PING
    /// fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Connecting shared store (ConnectionManager)");

        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(redis_url = %redis_url, "Shared store connected");
        Ok(Self { conn_manager })
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        let Some(bytes) = value.filter(|v| !v.is_empty()) else {
            return Ok(None);
        };

        // TTL returns seconds; -1 = no expiry, -2 = key vanished between calls.
        let ttl_secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        let ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs.unsigned_abs()));
        Ok(Some((bytes, ttl)))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[redis] set");
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        // MGET with a single key returns a scalar; normalize through the
        // command builder so the reply is always a vector.
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(values
            .into_iter()
            .map(|v| v.filter(|b| !b.is_empty()))
            .collect())
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        let count: usize = conn.del(keys).await?;
        debug!(count = count, "[redis] bulk delete");
        Ok(count)
    }

    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn_manager.clone();
        let result: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(result)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn info(&self) -> Result<String> {
        let mut conn = self.conn_manager.clone();
        let info: String = redis::cmd("INFO").arg("server").query_async(&mut conn).await?;
        Ok(info)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
