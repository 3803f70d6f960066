//! Type-erased queue interface.
//!
//! The registry holds queues of different item types side by side. Every
//! [`Queue<T>`] implements [`ManagedQueue`], which exposes the administrative
//! operations and an enqueue that takes untyped JSON.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::QueueError;
use crate::scheduler::{EnqueueOptions, EnqueueResult, Keys, Payload, Queue, QueueStatus};
use crate::storage::{StorageKind, StoredCount};

/// Administrative view of a queue, independent of its item type.
#[async_trait]
pub trait ManagedQueue: Send + Sync {
    fn name(&self) -> &str;

    fn storage_kind(&self) -> StorageKind;

    /// Converts `value` into the queue's item type and enqueues it.
    async fn enqueue_value(
        &self,
        key: &str,
        value: Value,
        opts: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError>;

    async fn start(&self) -> Result<(), QueueError>;

    async fn pause(&self, timeout: Option<Duration>) -> Result<(), QueueError>;

    async fn ignore_keys(&self, keys: Keys) -> Result<(), QueueError>;

    async fn restore_keys(&self, keys: Keys) -> Result<(), QueueError>;

    async fn block(&self, keys: Keys) -> Result<(), QueueError>;

    async fn release(&self, keys: Keys) -> Result<(), QueueError>;

    async fn flush(&self, keys: Keys) -> Result<(), QueueError>;

    async fn status(&self) -> Result<QueueStatus, QueueError>;

    async fn storage_count(&self) -> Result<StoredCount, QueueError>;

    async fn shutdown(&self) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: Payload> ManagedQueue for Queue<T> {
    fn name(&self) -> &str {
        Queue::name(self)
    }

    fn storage_kind(&self) -> StorageKind {
        self.storage().kind()
    }

    async fn enqueue_value(
        &self,
        key: &str,
        value: Value,
        opts: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError> {
        let item: T = match serde_json::from_value(value) {
            Ok(item) => item,
            Err(e) => {
                let err = QueueError::InvalidItem {
                    queue: Queue::name(self).to_string(),
                    reason: e.to_string(),
                };
                if opts.throw_errors {
                    return Err(err);
                }
                warn!(queue = %Queue::name(self), key = %key, error = %err, "Rejected untyped item");
                return Ok(EnqueueResult::failed(err));
            }
        };

        self.enqueue_with(key, item, opts).await
    }

    async fn start(&self) -> Result<(), QueueError> {
        Queue::start(self).await
    }

    async fn pause(&self, timeout: Option<Duration>) -> Result<(), QueueError> {
        Queue::pause(self, timeout).await
    }

    async fn ignore_keys(&self, keys: Keys) -> Result<(), QueueError> {
        Queue::ignore_keys(self, keys).await
    }

    async fn restore_keys(&self, keys: Keys) -> Result<(), QueueError> {
        Queue::restore_keys(self, keys).await
    }

    async fn block(&self, keys: Keys) -> Result<(), QueueError> {
        Queue::block(self, keys).await
    }

    async fn release(&self, keys: Keys) -> Result<(), QueueError> {
        Queue::release(self, keys).await
    }

    async fn flush(&self, keys: Keys) -> Result<(), QueueError> {
        Queue::flush(self, keys).await
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        Queue::status(self).await
    }

    async fn storage_count(&self) -> Result<StoredCount, QueueError> {
        Queue::storage_count(self).await
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        Queue::shutdown(self).await
    }
}
