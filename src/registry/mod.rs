//! Directory of named queues.
//!
//! This module provides:
//! - The [`Registry`], constructed once and passed by reference to whatever
//!   needs to find queues by name
//! - The [`ManagedQueue`] trait that lets queues of different item types live
//!   in the same registry
//!
//! Names are unique: registering a second queue under a taken name fails.

pub mod managed;

pub use managed::ManagedQueue;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{QueueError, RegistryError};
use crate::scheduler::{EnqueueOptions, EnqueueResult};

/// Registry of queues keyed by name.
#[derive(Default)]
pub struct Registry {
    queues: RwLock<HashMap<String, Arc<dyn ManagedQueue>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queue under its own name.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if the name is already taken.
    pub async fn register<Q>(&self, queue: Q) -> Result<(), RegistryError>
    where
        Q: ManagedQueue + 'static,
    {
        self.register_shared(Arc::new(queue)).await
    }

    /// Registers an already shared queue.
    pub async fn register_shared(&self, queue: Arc<dyn ManagedQueue>) -> Result<(), RegistryError> {
        let mut queues = self.queues.write().await;
        let name = queue.name().to_string();

        if queues.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        info!(queue = %name, storage = %queue.storage_kind(), "Queue registered");
        queues.insert(name, queue);
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<dyn ManagedQueue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Returns a queue or `RegistryError::NotFound`.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn ManagedQueue>, RegistryError> {
        self.lookup(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }

    /// Queue names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.queues.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.read().await.is_empty()
    }

    /// Removes a queue from the registry and returns it.
    ///
    /// The queue keeps running while other handles to it exist; call
    /// [`ManagedQueue::shutdown`] on the result to stop it.
    pub async fn remove(&self, name: &str) -> Result<Arc<dyn ManagedQueue>, RegistryError> {
        let removed = self
            .queues
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        info!(queue = %name, "Queue removed from registry");
        Ok(removed)
    }

    /// Enqueues an untyped item into a named queue.
    ///
    /// A missing queue is reported as a `QueueNotFound` result, not an error.
    pub async fn enqueue(
        &self,
        name: &str,
        key: &str,
        value: Value,
        opts: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError> {
        match self.lookup(name).await {
            Some(queue) => queue.enqueue_value(key, value, opts).await,
            None => Ok(EnqueueResult::not_found(name)),
        }
    }

    /// Shuts down every registered queue.
    pub async fn shutdown_all(&self) {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();

        for queue in queues {
            if let Err(e) = queue.shutdown().await {
                warn!(queue = %queue.name(), error = %e, "Queue shutdown failed");
            }
        }
    }
}
