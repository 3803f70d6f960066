//! Per-key ordered item storage.
//!
//! This module provides the storage abstraction consumed by the scheduling
//! engine and its four backends:
//!
//! - **MemoryStorage**: in-process deques, lost on exit
//! - **FileSystemStorage**: one append-only log file, shareable by many queues
//! - **RedisListStorage**: one Redis list per key
//! - **RedisSetStorage**: one Redis sorted set per key, with TTL eviction
//!
//! # Ordering contract
//!
//! `push` never reorders items already stored for a key. `pop_right` removes
//! the oldest items (FIFO) and returns them oldest first; `pop_left` removes
//! the newest items (LIFO) and returns them newest first. Both return fewer
//! items than requested, possibly none, without blocking.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nqs::storage::{MemoryStorage, QueueItem, Storage};
//!
//! let storage = MemoryStorage::new("orders");
//! storage.push("eu", QueueItem::now(b"{\"id\":1}".to_vec())).await?;
//! let items = storage.pop_right("eu", 10).await?;
//! ```

pub mod file_system;
pub mod memory;
pub mod redis_list;
pub mod redis_set;
mod ttl;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub use file_system::{FileSystemStorage, SharedLogFile};
pub use memory::MemoryStorage;
pub use redis_list::RedisListStorage;
pub use redis_set::RedisSetStorage;

/// Snapshot of pending item counts per key.
///
/// Always a point-in-time view: it may be stale as soon as it is returned.
pub type StoredCount = HashMap<String, usize>;

/// Popping discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Oldest item first.
    #[default]
    Fifo,
    /// Newest item first.
    Lifo,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fifo => write!(f, "FIFO"),
            Mode::Lifo => write!(f, "LIFO"),
        }
    }
}

/// An item as held by storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Push time in milliseconds since the Unix epoch.
    pub push_timestamp: i64,
    /// Encoded payload (see [`crate::codec`]).
    pub payload: Vec<u8>,
}

impl QueueItem {
    /// Creates an item stamped with the current time.
    pub fn now(payload: Vec<u8>) -> Self {
        Self {
            push_timestamp: now_millis(),
            payload,
        }
    }

    /// Creates an item with an explicit push timestamp.
    pub fn with_timestamp(push_timestamp: i64, payload: Vec<u8>) -> Self {
        Self {
            push_timestamp,
            payload,
        }
    }
}

/// Identifies a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    FileSystem,
    RedisList,
    RedisSortedSet,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::FileSystem => write!(f, "file"),
            StorageKind::RedisList => write!(f, "redis_list"),
            StorageKind::RedisSortedSet => write!(f, "redis_set"),
        }
    }
}

/// Ordered per-key item store used by a queue.
///
/// One storage instance belongs to exactly one queue name; backends that share
/// physical resources (a log file, a Redis database) partition them by that
/// name.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Name of the queue this storage belongs to.
    fn name(&self) -> &str;

    /// Backend identifier.
    fn kind(&self) -> StorageKind;

    /// Appends an item for a key.
    async fn push(&self, key: &str, item: QueueItem) -> Result<(), StorageError>;

    /// Removes and returns up to `count` of the oldest items, oldest first.
    async fn pop_right(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError>;

    /// Removes and returns up to `count` of the newest items, newest first.
    async fn pop_left(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError>;

    /// Returns the number of pending items per key.
    async fn stored_count(&self) -> Result<StoredCount, StorageError>;

    /// Drops pending items for the given keys, or for every key when empty.
    async fn flush(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Whether the scheduler may start dequeuing.
    ///
    /// Backends with a mandatory startup pass (TTL eviction) report `false`
    /// until that pass has completed.
    fn is_ready(&self) -> bool {
        true
    }

    /// Pops using the given discipline.
    async fn pop(&self, mode: Mode, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        match mode {
            Mode::Fifo => self.pop_right(key, count).await,
            Mode::Lifo => self.pop_left(key, count).await,
        }
    }
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Queue name as it appears inside Redis keys.
///
/// `%` and `:` are percent-encoded, so the `nqs:{queue}:` prefix of one queue
/// never matches the keys of another.
pub(crate) fn redis_queue_id(name: &str) -> String {
    name.replace('%', "%25").replace(':', "%3A")
}

/// Escapes glob metacharacters for a Redis `KEYS` pattern.
pub(crate) fn glob_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis record carrying an item; the id keeps sorted-set members unique when
/// identical payloads are pushed within the same millisecond.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RedisRecord {
    pub id: uuid::Uuid,
    #[serde(rename = "pushTimestamp")]
    pub push_timestamp: i64,
    pub payload: String,
}

impl RedisRecord {
    pub(crate) fn encode(item: &QueueItem) -> Result<String, StorageError> {
        let record = RedisRecord {
            id: uuid::Uuid::new_v4(),
            push_timestamp: item.push_timestamp,
            payload: crate::codec::to_text(&item.payload)?,
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub(crate) fn decode(raw: &str) -> Result<QueueItem, StorageError> {
        let record: RedisRecord = serde_json::from_str(raw)?;
        Ok(QueueItem {
            push_timestamp: record.push_timestamp,
            payload: crate::codec::from_text(&record.payload)?,
        })
    }
}
