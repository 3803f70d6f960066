//! Redis list storage backend.
//!
//! Each key of a queue is one Redis list named `nqs:{queue}:list:{key}`, with
//! the queue name escaped by [`super::redis_queue_id`].
//! Items are added with LPUSH, so the right end holds the oldest item:
//! FIFO pops with RPOP and LIFO pops with LPOP. No TTL support.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::{glob_escape, redis_queue_id, QueueItem, RedisRecord, Storage, StorageKind, StoredCount};
use crate::error::StorageError;

/// Storage backed by one Redis list per key.
pub struct RedisListStorage {
    name: String,
    redis: ConnectionManager,
    key_head: String,
}

impl RedisListStorage {
    /// Connects to Redis and creates the storage for a queue.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConnectionFailed` if the connection fails.
    pub async fn connect(name: impl Into<String>, redis_url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(name, redis))
    }

    /// Creates the storage from an existing connection manager.
    pub fn from_connection(name: impl Into<String>, redis: ConnectionManager) -> Self {
        let name = name.into();
        Self {
            key_head: format!("nqs:{}:list:", redis_queue_id(&name)),
            name,
            redis,
        }
    }

    fn list_key(&self, key: &str) -> String {
        format!("{}{}", self.key_head, key)
    }

    fn item_key<'a>(&self, redis_key: &'a str) -> Option<&'a str> {
        redis_key.strip_prefix(self.key_head.as_str())
    }

    async fn queue_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", glob_escape(&self.key_head))).await?;
        Ok(keys)
    }

    async fn pop_n(&self, key: &str, count: usize, right: bool) -> Result<Vec<QueueItem>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let list_key = self.list_key(key);
        let mut pipe = redis::pipe();
        for _ in 0..count {
            if right {
                pipe.rpop(&list_key, None);
            } else {
                pipe.lpop(&list_key, None);
            }
        }

        let mut conn = self.redis.clone();
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        raw.into_iter()
            .flatten()
            .map(|r| RedisRecord::decode(&r))
            .collect()
    }
}

#[async_trait]
impl Storage for RedisListStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::RedisList
    }

    async fn push(&self, key: &str, item: QueueItem) -> Result<(), StorageError> {
        let record = RedisRecord::encode(&item)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.list_key(key), record).await?;
        Ok(())
    }

    async fn pop_right(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        self.pop_n(key, count, true).await
    }

    async fn pop_left(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        self.pop_n(key, count, false).await
    }

    async fn stored_count(&self) -> Result<StoredCount, StorageError> {
        let mut conn = self.redis.clone();
        let mut counts = StoredCount::new();

        for redis_key in self.queue_keys().await? {
            let Some(key) = self.item_key(&redis_key) else {
                continue;
            };
            let len: Result<usize, redis::RedisError> = conn.llen(&redis_key).await;
            match len {
                Ok(len) => {
                    counts.insert(key.to_string(), len);
                }
                Err(e) if e.code() == Some("WRONGTYPE") => {
                    warn!(queue = %self.name, key = %redis_key, "Skipping non list key");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(counts)
    }

    async fn flush(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut conn = self.redis.clone();

        for redis_key in self.queue_keys().await? {
            let Some(key) = self.item_key(&redis_key) else {
                continue;
            };
            if keys.is_empty() || keys.iter().any(|k| k == key) {
                conn.del::<_, ()>(&redis_key).await?;
            }
        }

        Ok(())
    }
}
