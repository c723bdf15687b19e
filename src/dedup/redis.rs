use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands as _, Client, aio::ConnectionManager};

use super::{DedupKey, MarkerStore};

/// Marker store shared by every process talking to the same Redis.
///
/// Key format: `{prefix}:{kind}-in-queue-{id}`.
#[derive(Clone)]
pub struct RedisMarkers {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisMarkers {
    /// Connect to Redis at `url`, e.g. `redis://localhost:6379`.
    pub async fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self, redis::RedisError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(%url, "Connected to Redis for dedup markers");

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, key: &DedupKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl MarkerStore for RedisMarkers {
    async fn exists(&self, key: &DedupKey) -> Result<bool, tower::BoxError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(self.key(key)).await?;
        Ok(found)
    }

    async fn set(&self, key: &DedupKey, ttl: Duration) -> Result<(), tower::BoxError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(self.key(key), 1u8, seconds).await?;
        tracing::debug!(marker = %key, seconds, "Dedup marker set");
        Ok(())
    }

    async fn clear(&self, key: &DedupKey) -> Result<(), tower::BoxError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(key)).await?;
        Ok(())
    }
}
