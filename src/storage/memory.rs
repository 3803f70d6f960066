//! In-process storage backend.
//!
//! Each key maps to a deque. New items are pushed at the front, so the back
//! always holds the oldest item: FIFO pops from the back, LIFO from the front.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{QueueItem, Storage, StorageKind, StoredCount};
use crate::error::StorageError;

/// Storage that keeps items in memory for the lifetime of the process.
pub struct MemoryStorage {
    name: String,
    memory: RwLock<HashMap<String, VecDeque<QueueItem>>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory storage for a queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory: RwLock::new(HashMap::new()),
        }
    }

    fn take(&self, key: &str, count: usize, from_back: bool) -> Vec<QueueItem> {
        let mut memory = self.memory.write().expect("memory write lock poisoned");
        let Some(items) = memory.get_mut(key) else {
            return Vec::new();
        };

        let mut popped = Vec::with_capacity(count.min(items.len()));
        for _ in 0..count {
            let next = if from_back {
                items.pop_back()
            } else {
                items.pop_front()
            };
            match next {
                Some(item) => popped.push(item),
                None => break,
            }
        }
        popped
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn push(&self, key: &str, item: QueueItem) -> Result<(), StorageError> {
        self.memory
            .write()
            .expect("memory write lock poisoned")
            .entry(key.to_string())
            .or_default()
            .push_front(item);
        Ok(())
    }

    async fn pop_right(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        Ok(self.take(key, count, true))
    }

    async fn pop_left(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        Ok(self.take(key, count, false))
    }

    async fn stored_count(&self) -> Result<StoredCount, StorageError> {
        let memory = self.memory.read().expect("memory read lock poisoned");
        Ok(memory
            .iter()
            .map(|(key, items)| (key.clone(), items.len()))
            .collect())
    }

    async fn flush(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut memory = self.memory.write().expect("memory write lock poisoned");
        if keys.is_empty() {
            memory.clear();
        } else {
            for key in keys {
                memory.remove(key);
            }
        }
        Ok(())
    }
}
