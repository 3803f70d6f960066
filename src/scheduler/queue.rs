//! Queue handle, builder and enqueue results.
//!
//! A [`Queue`] is a cheap, cloneable handle to a worker task that owns all of
//! the queue's mutable state. Every operation is sent to the worker as a
//! command and answered over a oneshot channel, so callbacks running inside a
//! batch can freely call back into their own queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nqs::scheduler::{DequeueHandler, QueueBuilder};
//! use nqs::storage::MemoryStorage;
//!
//! let queue = QueueBuilder::<u64>::new("jobs", Arc::new(MemoryStorage::new("jobs")))
//!     .with_on_dequeue(DequeueHandler::awaited(|n, ctx| async move {
//!         println!("{} -> {}", ctx.key, n);
//!         Ok(())
//!     }))
//!     .build();
//!
//! let result = queue.enqueue("k1", 42).await?;
//! assert!(result.enqueued);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::engine::Worker;
use super::rules::{CloneRule, DequeueHandler, KeyRules, MaxRetryHandler};
use crate::error::{QueueError, RegistryError, StorageError};
use crate::registry::Registry;
use crate::storage::{Mode, Storage, StoredCount};

/// Reserved key meaning "every key".
pub const WILDCARD: &str = "*";

/// Default delay between two ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_micros(1_000_000 / 60);

/// Bounds required of queued items.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A selection of keys for administrative operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keys {
    /// Every key known to the queue.
    All,
    /// An explicit list.
    Only(Vec<String>),
}

impl Keys {
    /// Parses `*` or a comma-separated key list.
    pub fn parse(raw: &str) -> Self {
        if raw.trim() == WILDCARD {
            return Keys::All;
        }
        Keys::Only(
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    /// A single key.
    pub fn one(key: impl Into<String>) -> Self {
        Keys::Only(vec![key.into()])
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Keys::All)
    }
}

impl From<&str> for Keys {
    fn from(raw: &str) -> Self {
        Keys::parse(raw)
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys::Only(keys)
    }
}

impl From<&[&str]> for Keys {
    fn from(keys: &[&str]) -> Self {
        Keys::Only(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// Outcome code of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueResultCode {
    Enqueued,
    KeyIgnored,
    KeyNotPrioritized,
    MissingCondition,
    KeyBlocked,
    QueueNotFound,
    ErrorOccurred,
}

impl fmt::Display for EnqueueResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            EnqueueResultCode::Enqueued => "Enqueued",
            EnqueueResultCode::KeyIgnored => "KeyIgnored",
            EnqueueResultCode::KeyNotPrioritized => "KeyNotPrioritized",
            EnqueueResultCode::MissingCondition => "MissingCondition",
            EnqueueResultCode::KeyBlocked => "KeyBlocked",
            EnqueueResultCode::QueueNotFound => "QueueNotFound",
            EnqueueResultCode::ErrorOccurred => "ErrorOccurred",
        };
        write!(f, "{}", code)
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub enqueued: bool,
    pub code: EnqueueResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnqueueResult {
    pub(crate) fn accepted(copies: usize) -> Self {
        Self {
            enqueued: true,
            code: EnqueueResultCode::Enqueued,
            message: (copies > 1).then(|| format!("Enqueued {} copies", copies)),
            error: None,
        }
    }

    pub(crate) fn rejected(code: EnqueueResultCode, message: impl Into<String>) -> Self {
        Self {
            enqueued: false,
            code,
            message: Some(message.into()),
            error: None,
        }
    }

    pub(crate) fn failed(error: impl fmt::Display) -> Self {
        Self {
            enqueued: false,
            code: EnqueueResultCode::ErrorOccurred,
            message: None,
            error: Some(error.to_string()),
        }
    }

    pub(crate) fn not_found(queue: &str) -> Self {
        Self::rejected(
            EnqueueResultCode::QueueNotFound,
            format!("Queue '{}' does not exist", queue),
        )
    }
}

/// Options for a single enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Return internal errors as `Err` instead of an `ErrorOccurred` result.
    pub throw_errors: bool,
    /// Reject the item with `KeyBlocked` when its key is blocked.
    pub reject_if_blocked: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            throw_errors: true,
            reject_if_blocked: false,
        }
    }
}

impl EnqueueOptions {
    pub fn with_throw_errors(mut self, throw_errors: bool) -> Self {
        self.throw_errors = throw_errors;
        self
    }

    pub fn with_reject_if_blocked(mut self, reject: bool) -> Self {
        self.reject_if_blocked = reject;
        self
    }
}

/// Point-in-time view of a queue's scheduling state.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub paused: bool,
    /// Whether a ticker is currently armed.
    pub running: bool,
    pub batch_in_flight: bool,
    /// Live pending counter maintained by the worker.
    pub pending: usize,
    /// Known keys in discovery order.
    pub keys: Vec<String>,
    pub priority: Vec<String>,
    pub ignored: Vec<String>,
    pub blocked: Vec<String>,
    pub locked: Vec<String>,
    pub default_mode: Mode,
    /// Effective mode per known key.
    pub modes: BTreeMap<String, Mode>,
}

pub(crate) type Reply<R> = oneshot::Sender<R>;

/// Messages understood by the worker task.
pub(crate) enum Command<T> {
    Enqueue {
        key: String,
        item: T,
        opts: EnqueueOptions,
        reply: Reply<Result<EnqueueResult, QueueError>>,
    },
    Start {
        reply: Reply<()>,
    },
    Pause {
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    Ignore {
        keys: Vec<String>,
        reply: Reply<()>,
    },
    Restore {
        keys: Keys,
        reply: Reply<()>,
    },
    Block {
        keys: Keys,
        reply: Reply<()>,
    },
    Release {
        keys: Keys,
        reply: Reply<()>,
    },
    Flush {
        keys: Keys,
        reply: Reply<Result<(), StorageError>>,
    },
    SetDefaultRules {
        rules: KeyRules<T>,
        reply: Reply<()>,
    },
    SetKeyRules {
        key: String,
        rules: KeyRules<T>,
        reply: Reply<()>,
    },
    SetPriority {
        keys: Vec<String>,
        ignore_not_prioritized: bool,
        reply: Reply<()>,
    },
    RandomizePriority {
        enabled: bool,
        reply: Reply<()>,
    },
    Status {
        reply: Reply<QueueStatus>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a running queue.
pub struct Queue<T> {
    name: Arc<str>,
    storage: Arc<dyn Storage>,
    commands: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            storage: Arc::clone(&self.storage),
            commands: self.commands.clone(),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("storage", &self.storage.kind())
            .finish()
    }
}

impl<T: Payload> Queue<T> {
    pub(crate) fn from_parts(
        name: Arc<str>,
        storage: Arc<dyn Storage>,
        commands: mpsc::UnboundedSender<Command<T>>,
    ) -> Self {
        Self {
            name,
            storage,
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage backing this queue.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn request<R>(&self, make: impl FnOnce(Reply<R>) -> Command<T>) -> Result<R, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| QueueError::WorkerStopped(self.name.to_string()))?;
        rx.await
            .map_err(|_| QueueError::WorkerStopped(self.name.to_string()))
    }

    /// Enqueues an item with default options.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ReservedKey` for the `*` key, or any storage or
    /// serialization failure.
    pub async fn enqueue(&self, key: &str, item: T) -> Result<EnqueueResult, QueueError> {
        self.enqueue_with(key, item, EnqueueOptions::default()).await
    }

    /// Enqueues an item.
    ///
    /// Rejections (ignored key, missing priority, ignore-item predicate,
    /// blocked key when requested) are reported through the result code and
    /// never as errors.
    pub async fn enqueue_with(
        &self,
        key: &str,
        item: T,
        opts: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError> {
        let outcome = if key == WILDCARD {
            Err(QueueError::ReservedKey)
        } else {
            let key = key.to_string();
            self.request(|reply| Command::Enqueue {
                key,
                item,
                opts,
                reply,
            })
            .await
            .and_then(|result| result)
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(e) if opts.throw_errors => Err(e),
            Err(e) => {
                warn!(queue = %self.name, key = %key, error = %e, "Enqueue failed");
                Ok(EnqueueResult::failed(e))
            }
        }
    }

    /// Starts (or resumes) ticking. Idempotent.
    pub async fn start(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stops ticking; with a timeout, resumes automatically afterwards.
    pub async fn pause(&self, timeout: Option<Duration>) -> Result<(), QueueError> {
        self.request(|reply| Command::Pause { timeout, reply }).await
    }

    /// Rejects future enqueues for the given keys.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::WildcardNotAllowed` for [`Keys::All`]; pause the
    /// queue instead.
    pub async fn ignore_keys(&self, keys: impl Into<Keys>) -> Result<(), QueueError> {
        let keys = match keys.into() {
            Keys::All => return Err(QueueError::WildcardNotAllowed("ignore")),
            Keys::Only(keys) => keys,
        };
        self.request(|reply| Command::Ignore { keys, reply }).await
    }

    /// Accepts enqueues again; [`Keys::All`] clears the ignore set.
    pub async fn restore_keys(&self, keys: impl Into<Keys>) -> Result<(), QueueError> {
        let keys = keys.into();
        self.request(|reply| Command::Restore { keys, reply }).await
    }

    /// Stops dequeuing the given keys. Pushing is still allowed.
    pub async fn block(&self, keys: impl Into<Keys>) -> Result<(), QueueError> {
        let keys = keys.into();
        self.request(|reply| Command::Block { keys, reply }).await
    }

    pub async fn release(&self, keys: impl Into<Keys>) -> Result<(), QueueError> {
        let keys = keys.into();
        self.request(|reply| Command::Release { keys, reply }).await
    }

    /// Drops pending items without delivering them. An empty key list
    /// flushes every key, like [`Keys::All`].
    pub async fn flush(&self, keys: impl Into<Keys>) -> Result<(), QueueError> {
        let keys = keys.into();
        self.request(|reply| Command::Flush { keys, reply }).await??;
        Ok(())
    }

    /// Merges `rules` into the queue-wide defaults.
    pub async fn set_default_rules(&self, rules: KeyRules<T>) -> Result<(), QueueError> {
        self.request(|reply| Command::SetDefaultRules { rules, reply })
            .await
    }

    /// Merges `rules` into the rules of one key, registering the key.
    pub async fn set_key_rules(&self, key: &str, rules: KeyRules<T>) -> Result<(), QueueError> {
        if key == WILDCARD {
            return Err(QueueError::ReservedKey);
        }
        let key = key.to_string();
        self.request(|reply| Command::SetKeyRules { key, rules, reply })
            .await
    }

    /// Replaces the priority list.
    pub async fn set_priority(
        &self,
        keys: Vec<String>,
        ignore_not_prioritized: bool,
    ) -> Result<(), QueueError> {
        self.request(|reply| Command::SetPriority {
            keys,
            ignore_not_prioritized,
            reply,
        })
        .await
    }

    /// Visits all known keys in random order each tick instead of by priority.
    pub async fn randomize_priority(&self, enabled: bool) -> Result<(), QueueError> {
        self.request(|reply| Command::RandomizePriority { enabled, reply })
            .await
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(self.status().await?.paused)
    }

    pub async fn is_key_ignored(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.status().await?.ignored.iter().any(|k| k == key))
    }

    pub async fn is_blocked(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.status().await?.blocked.iter().any(|k| k == key))
    }

    /// Effective mode of a key, or the default mode.
    pub async fn dequeue_mode(&self, key: Option<&str>) -> Result<Mode, QueueError> {
        let status = self.status().await?;
        Ok(key
            .and_then(|k| status.modes.get(k).copied())
            .unwrap_or(status.default_mode))
    }

    /// Pending items per key, read directly from storage.
    pub async fn storage_count(&self) -> Result<StoredCount, QueueError> {
        Ok(self.storage.stored_count().await?)
    }

    /// Stops the worker after the batch in flight has completed.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Settings the worker is created with.
pub(crate) struct QueueSettings<T> {
    pub name: Arc<str>,
    pub storage: Arc<dyn Storage>,
    pub gzip: bool,
    pub tick_interval: Duration,
    pub defaults: KeyRules<T>,
    pub key_rules: Vec<(String, KeyRules<T>)>,
    pub priority: Vec<String>,
    pub ignore_not_prioritized: bool,
    pub randomize_priority: bool,
    pub ignored: Vec<String>,
    pub autostart: bool,
}

/// Builder for [`Queue`].
pub struct QueueBuilder<T> {
    settings: QueueSettings<T>,
}

impl<T: Payload> QueueBuilder<T> {
    pub fn new(name: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            settings: QueueSettings {
                name: Arc::from(name.into()),
                storage,
                gzip: false,
                tick_interval: DEFAULT_TICK_INTERVAL,
                defaults: KeyRules::default(),
                key_rules: Vec::new(),
                priority: Vec::new(),
                ignore_not_prioritized: false,
                randomize_priority: false,
                ignored: Vec::new(),
                autostart: true,
            },
        }
    }

    /// Compresses payloads with gzip before storing them.
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.settings.gzip = gzip;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.settings.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.settings.defaults.mode = Some(mode);
        self
    }

    pub fn with_dequeue_size(mut self, size: usize) -> Self {
        self.settings.defaults.dequeue_size = Some(size.max(1));
        self
    }

    pub fn with_dequeue_interval(mut self, interval: Duration) -> Self {
        self.settings.defaults.dequeue_interval = Some(interval);
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.settings.defaults.max_retry = Some(max_retry.max(1));
        self
    }

    pub fn with_on_dequeue(mut self, handler: DequeueHandler<T>) -> Self {
        self.settings.defaults.on_dequeue = Some(handler);
        self
    }

    pub fn with_on_max_retry(mut self, handler: MaxRetryHandler<T>) -> Self {
        self.settings.defaults.on_max_retry = Some(handler);
        self
    }

    pub fn with_ignore_item(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.settings.defaults.ignore_item = Some(Arc::new(predicate));
        self
    }

    pub fn with_clone_on_enqueue(mut self, rule: CloneRule<T>) -> Self {
        self.settings.defaults.clone_on_enqueue = Some(rule);
        self
    }

    pub fn with_clone_on_dequeue(mut self, rule: CloneRule<T>) -> Self {
        self.settings.defaults.clone_on_dequeue = Some(rule);
        self
    }

    /// Adds rules for one key. Repeated calls for the same key merge.
    pub fn with_key_rules(mut self, key: impl Into<String>, rules: KeyRules<T>) -> Self {
        self.settings.key_rules.push((key.into(), rules));
        self
    }

    /// Keys visited first on every tick, in this order.
    pub fn with_priority<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.priority = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Rejects enqueues for keys missing from the priority list.
    pub fn with_ignore_not_prioritized(mut self, enabled: bool) -> Self {
        self.settings.ignore_not_prioritized = enabled;
        self
    }

    pub fn with_randomize_priority(mut self, enabled: bool) -> Self {
        self.settings.randomize_priority = enabled;
        self
    }

    /// Keys whose enqueues are rejected from the start.
    pub fn with_ignored_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.ignored = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the queue starts ticking immediately (default `true`).
    ///
    /// A queue built without autostart is paused until [`Queue::start`].
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.settings.autostart = autostart;
        self
    }

    /// Spawns the worker task and returns its handle.
    ///
    /// Must be called from within a Tokio runtime. The worker stops when
    /// every handle has been dropped or [`Queue::shutdown`] is called.
    pub fn build(self) -> Queue<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = self.settings;
        let name = Arc::clone(&settings.name);
        let storage = Arc::clone(&settings.storage);

        let worker = Worker::new(settings, rx, tx.downgrade());
        tokio::spawn(worker.run());

        Queue::from_parts(name, storage, tx)
    }

    /// Builds the queue and registers it.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if the name is taken; the new
    /// worker is stopped.
    pub async fn register(self, registry: &Registry) -> Result<Queue<T>, RegistryError> {
        if registry.contains(&self.settings.name).await {
            return Err(RegistryError::Duplicate(self.settings.name.to_string()));
        }
        let queue = self.build();
        registry.register(queue.clone()).await?;
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_parse() {
        assert_eq!(Keys::parse("*"), Keys::All);
        assert_eq!(
            Keys::parse("a, b,,c"),
            Keys::Only(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(Keys::from("solo"), Keys::one("solo"));
    }

    #[test]
    fn test_enqueue_options_default_throws() {
        let opts = EnqueueOptions::default();
        assert!(opts.throw_errors);
        assert!(!opts.reject_if_blocked);
    }

    #[test]
    fn test_result_code_serializes_by_name() {
        let result = EnqueueResult::rejected(EnqueueResultCode::KeyIgnored, "ignored");
        let json = serde_json::to_value(&result).expect("serialize");

        assert_eq!(json["code"], "KeyIgnored");
        assert_eq!(json["enqueued"], false);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_default_tick_interval_is_sixty_hz() {
        assert_eq!(DEFAULT_TICK_INTERVAL.as_micros(), 16_666);
    }
}
