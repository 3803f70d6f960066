//! Redis sorted-set storage backend with TTL eviction.
//!
//! Each key is a sorted set named `nqs:{queue}:zset:{key}` (queue name escaped
//! by [`super::redis_queue_id`]); members are
//! scored by push timestamp, so the lowest score is the oldest item. When a
//! TTL is configured every push also records its timestamp in the list
//! `nqs:{queue}:ttl`, which drives the sweeper in [`super::ttl`].
//!
//! Pops run the range read and the rank removal in one atomic pipeline, so two
//! consumers never receive the same member.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::ttl::{SweepTarget, TtlSweeper};
use super::{glob_escape, redis_queue_id, QueueItem, RedisRecord, Storage, StorageKind, StoredCount};
use crate::error::StorageError;

/// Redis keys of one queue and the connection used to reach them.
struct SetIndex {
    name: String,
    redis: ConnectionManager,
    key_head: String,
    ttl_key: String,
}

impl SetIndex {
    fn set_key(&self, key: &str) -> String {
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
}

#[async_trait]
impl SweepTarget for SetIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_timestamp(&self) -> Result<Option<i64>, StorageError> {
        let mut conn = self.redis.clone();
        let ts: Option<i64> = conn.rpop(&self.ttl_key, None).await?;
        Ok(ts)
    }

    async fn remove_up_to(&self, threshold: i64) -> Result<usize, StorageError> {
        let mut conn = self.redis.clone();
        let mut removed = 0;

        for redis_key in self.queue_keys().await? {
            let n: usize = conn.zrembyscore(&redis_key, "-inf", threshold).await?;
            removed += n;
        }

        Ok(removed)
    }
}

/// Storage backed by one Redis sorted set per key.
pub struct RedisSetStorage {
    index: Arc<SetIndex>,
    sweeper: Option<TtlSweeper>,
}

impl RedisSetStorage {
    /// Connects to Redis and creates the storage for a queue.
    ///
    /// With `ttl` set, items older than it are evicted and the storage is not
    /// ready until the startup sweep has run. Must be called from within a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        name: impl Into<String>,
        redis_url: &str,
        ttl: Option<Duration>,
    ) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(name, redis, ttl))
    }

    /// Creates the storage from an existing connection manager.
    pub fn from_connection(name: impl Into<String>, redis: ConnectionManager, ttl: Option<Duration>) -> Self {
        let name = name.into();
        let id = redis_queue_id(&name);
        let index = Arc::new(SetIndex {
            key_head: format!("nqs:{}:zset:", id),
            ttl_key: format!("nqs:{}:ttl", id),
            name,
            redis,
        });

        let sweeper = ttl.map(|ttl| TtlSweeper::spawn(index.clone(), ttl));

        Self { index, sweeper }
    }

    async fn pop_n(&self, key: &str, count: usize, oldest: bool) -> Result<Vec<QueueItem>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let set_key = self.index.set_key(key);
        let last = count as isize - 1;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if oldest {
            pipe.zrange(&set_key, 0, last).zremrangebyrank(&set_key, 0, last);
        } else {
            pipe.zrevrange(&set_key, 0, last)
                .zremrangebyrank(&set_key, -(count as isize), -1);
        }

        let mut conn = self.index.redis.clone();
        let (members, _removed): (Vec<String>, usize) = pipe.query_async(&mut conn).await?;

        members.iter().map(|m| RedisRecord::decode(m)).collect()
    }
}

#[async_trait]
impl Storage for RedisSetStorage {
    fn name(&self) -> &str {
        &self.index.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::RedisSortedSet
    }

    async fn push(&self, key: &str, item: QueueItem) -> Result<(), StorageError> {
        let record = RedisRecord::encode(&item)?;
        let mut conn = self.index.redis.clone();

        if let Some(sweeper) = &self.sweeper {
            conn.lpush::<_, _, ()>(&self.index.ttl_key, item.push_timestamp).await?;
            sweeper.notify_push();
        }

        conn.zadd::<_, _, _, ()>(self.index.set_key(key), record, item.push_timestamp)
            .await?;
        Ok(())
    }

    async fn pop_right(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        self.pop_n(key, count, true).await
    }

    async fn pop_left(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        self.pop_n(key, count, false).await
    }

    async fn stored_count(&self) -> Result<StoredCount, StorageError> {
        let mut conn = self.index.redis.clone();
        let mut counts = StoredCount::new();

        for redis_key in self.index.queue_keys().await? {
            let Some(key) = self.index.item_key(&redis_key) else {
                continue;
            };
            let len: Result<usize, redis::RedisError> = conn.zcard(&redis_key).await;
            match len {
                Ok(len) => {
                    counts.insert(key.to_string(), len);
                }
                Err(e) if e.code() == Some("WRONGTYPE") => {
                    warn!(queue = %self.index.name, key = %redis_key, "Skipping non sorted-set key");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(counts)
    }

    async fn flush(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut conn = self.index.redis.clone();

        for redis_key in self.index.queue_keys().await? {
            let Some(key) = self.index.item_key(&redis_key) else {
                continue;
            };
            if keys.is_empty() || keys.iter().any(|k| k == key) {
                conn.del::<_, ()>(&redis_key).await?;
            }
        }

        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.sweeper.as_ref().map_or(true, TtlSweeper::is_ready)
    }
}
