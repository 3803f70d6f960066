//! Dequeue rules and callback types.
//!
//! A queue has one set of default rules and, optionally, one set per key.
//! Every field is optional; lookups fall back from the key to the defaults and
//! then to a hard default (FIFO, size 1, one attempt, no interval).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::queue::Queue;
use crate::storage::Mode;

/// Default number of items popped per tick.
pub const DEFAULT_DEQUEUE_SIZE: usize = 1;

/// Default number of delivery attempts (no retry).
pub const DEFAULT_MAX_RETRY: u32 = 1;

/// Information passed to callbacks alongside the item.
pub struct DequeueContext<T> {
    /// Handle to the queue the item came from.
    pub queue: Queue<T>,
    /// Key the item was stored under.
    pub key: String,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

type DequeueFn<T> = dyn Fn(T, DequeueContext<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
type MaxRetryFn<T> = dyn Fn(anyhow::Error, T, DequeueContext<T>) -> BoxFuture<'static, ()> + Send + Sync;

/// Callback invoked for every dequeued item.
pub struct DequeueHandler<T> {
    callback: Arc<DequeueFn<T>>,
    awaited: bool,
}

impl<T> Clone for DequeueHandler<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            awaited: self.awaited,
        }
    }
}

impl<T: Send + 'static> DequeueHandler<T> {
    /// A handler the tick waits for before delivering the next item.
    pub fn awaited<F, Fut>(f: F) -> Self
    where
        F: Fn(T, DequeueContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |item: T, ctx: DequeueContext<T>| f(item, ctx).boxed()),
            awaited: true,
        }
    }

    /// A handler spawned as its own task; completion order is not guaranteed.
    pub fn detached<F, Fut>(f: F) -> Self
    where
        F: Fn(T, DequeueContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            awaited: false,
            ..Self::awaited(f)
        }
    }

    pub fn is_awaited(&self) -> bool {
        self.awaited
    }

    pub(crate) fn call(&self, item: T, ctx: DequeueContext<T>) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.callback)(item, ctx)
    }
}

/// Callback invoked once an item has exhausted its delivery attempts.
pub struct MaxRetryHandler<T> {
    callback: Arc<MaxRetryFn<T>>,
    awaited: bool,
}

impl<T> Clone for MaxRetryHandler<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            awaited: self.awaited,
        }
    }
}

impl<T: Send + 'static> MaxRetryHandler<T> {
    /// A hook the batch waits for.
    pub fn awaited<F, Fut>(f: F) -> Self
    where
        F: Fn(anyhow::Error, T, DequeueContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |error: anyhow::Error, item: T, ctx: DequeueContext<T>| {
                f(error, item, ctx).boxed()
            }),
            awaited: true,
        }
    }

    /// A hook spawned as its own task.
    pub fn detached<F, Fut>(f: F) -> Self
    where
        F: Fn(anyhow::Error, T, DequeueContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            awaited: false,
            ..Self::awaited(f)
        }
    }

    pub fn is_awaited(&self) -> bool {
        self.awaited
    }

    pub(crate) fn call(&self, error: anyhow::Error, item: T, ctx: DequeueContext<T>) -> BoxFuture<'static, ()> {
        (self.callback)(error, item, ctx)
    }
}

/// Predicate over an item.
pub type ItemPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Duplicates an item `count` times, optionally only when a condition holds.
pub struct CloneRule<T> {
    pub count: usize,
    pub condition: Option<ItemPredicate<T>>,
}

impl<T> Clone for CloneRule<T> {
    fn clone(&self) -> Self {
        Self {
            count: self.count,
            condition: self.condition.clone(),
        }
    }
}

impl<T> CloneRule<T> {
    /// Always produces `count` copies.
    pub fn always(count: usize) -> Self {
        Self {
            count,
            condition: None,
        }
    }

    /// Produces `count` copies of items matching `condition`.
    pub fn when(count: usize, condition: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            count,
            condition: Some(Arc::new(condition)),
        }
    }

    /// Number of copies to produce for `item`; 1 when the rule does not apply.
    pub fn copies(&self, item: &T) -> usize {
        match &self.condition {
            Some(condition) if !condition(item) => 1,
            _ => self.count,
        }
    }
}

/// Rule set for one key, or the queue-wide defaults.
pub struct KeyRules<T> {
    pub mode: Option<Mode>,
    pub dequeue_size: Option<usize>,
    /// Minimum delay between two pops of the same key.
    pub dequeue_interval: Option<Duration>,
    /// Total delivery attempts per item.
    pub max_retry: Option<u32>,
    pub on_dequeue: Option<DequeueHandler<T>>,
    pub on_max_retry: Option<MaxRetryHandler<T>>,
    /// Items matching this predicate are rejected at enqueue time.
    pub ignore_item: Option<ItemPredicate<T>>,
    pub clone_on_enqueue: Option<CloneRule<T>>,
    pub clone_on_dequeue: Option<CloneRule<T>>,
}

impl<T> Default for KeyRules<T> {
    fn default() -> Self {
        Self {
            mode: None,
            dequeue_size: None,
            dequeue_interval: None,
            max_retry: None,
            on_dequeue: None,
            on_max_retry: None,
            ignore_item: None,
            clone_on_enqueue: None,
            clone_on_dequeue: None,
        }
    }
}

impl<T> Clone for KeyRules<T> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            dequeue_size: self.dequeue_size,
            dequeue_interval: self.dequeue_interval,
            max_retry: self.max_retry,
            on_dequeue: self.on_dequeue.clone(),
            on_max_retry: self.on_max_retry.clone(),
            ignore_item: self.ignore_item.clone(),
            clone_on_enqueue: self.clone_on_enqueue.clone(),
            clone_on_dequeue: self.clone_on_dequeue.clone(),
        }
    }
}

impl<T: Send + 'static> KeyRules<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_dequeue_size(mut self, size: usize) -> Self {
        self.dequeue_size = Some(size.max(1));
        self
    }

    pub fn with_dequeue_interval(mut self, interval: Duration) -> Self {
        self.dequeue_interval = Some(interval);
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry.max(1));
        self
    }

    pub fn with_on_dequeue(mut self, handler: DequeueHandler<T>) -> Self {
        self.on_dequeue = Some(handler);
        self
    }

    pub fn with_on_max_retry(mut self, handler: MaxRetryHandler<T>) -> Self {
        self.on_max_retry = Some(handler);
        self
    }

    pub fn with_ignore_item(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.ignore_item = Some(Arc::new(predicate));
        self
    }

    pub fn with_clone_on_enqueue(mut self, rule: CloneRule<T>) -> Self {
        self.clone_on_enqueue = Some(rule);
        self
    }

    pub fn with_clone_on_dequeue(mut self, rule: CloneRule<T>) -> Self {
        self.clone_on_dequeue = Some(rule);
        self
    }
}

impl<T> KeyRules<T> {
    /// Overwrites every field that `other` sets.
    pub fn merge(&mut self, other: KeyRules<T>) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.dequeue_size.is_some() {
            self.dequeue_size = other.dequeue_size;
        }
        if other.dequeue_interval.is_some() {
            self.dequeue_interval = other.dequeue_interval;
        }
        if other.max_retry.is_some() {
            self.max_retry = other.max_retry;
        }
        if other.on_dequeue.is_some() {
            self.on_dequeue = other.on_dequeue;
        }
        if other.on_max_retry.is_some() {
            self.on_max_retry = other.on_max_retry;
        }
        if other.ignore_item.is_some() {
            self.ignore_item = other.ignore_item;
        }
        if other.clone_on_enqueue.is_some() {
            self.clone_on_enqueue = other.clone_on_enqueue;
        }
        if other.clone_on_dequeue.is_some() {
            self.clone_on_dequeue = other.clone_on_dequeue;
        }
    }
}

/// Two-level rule lookup: key rules first, then the defaults.
pub(crate) struct Effective<'a, T> {
    pub key: Option<&'a KeyRules<T>>,
    pub defaults: &'a KeyRules<T>,
}

impl<'a, T> Effective<'a, T> {
    pub(crate) fn new(key: Option<&'a KeyRules<T>>, defaults: &'a KeyRules<T>) -> Self {
        Self { key, defaults }
    }

    fn pick<R>(&self, field: impl Fn(&'a KeyRules<T>) -> Option<R>) -> Option<R> {
        self.key.and_then(&field).or_else(|| field(self.defaults))
    }

    pub(crate) fn mode(&self) -> Mode {
        self.pick(|r| r.mode).unwrap_or_default()
    }

    pub(crate) fn dequeue_size(&self) -> usize {
        self.pick(|r| r.dequeue_size).unwrap_or(DEFAULT_DEQUEUE_SIZE)
    }

    pub(crate) fn dequeue_interval(&self) -> Option<Duration> {
        self.pick(|r| r.dequeue_interval)
    }

    pub(crate) fn max_retry(&self) -> u32 {
        self.pick(|r| r.max_retry).unwrap_or(DEFAULT_MAX_RETRY)
    }

    pub(crate) fn on_dequeue(&self) -> Option<&'a DequeueHandler<T>> {
        self.pick(|r| r.on_dequeue.as_ref())
    }

    pub(crate) fn on_max_retry(&self) -> Option<&'a MaxRetryHandler<T>> {
        self.pick(|r| r.on_max_retry.as_ref())
    }

    /// True when either the key or the default predicate rejects `item`.
    pub(crate) fn ignores(&self, item: &T) -> bool {
        let key_ignores = self
            .key
            .and_then(|r| r.ignore_item.as_ref())
            .is_some_and(|p| p(item));
        key_ignores || self.defaults.ignore_item.as_ref().is_some_and(|p| p(item))
    }

    pub(crate) fn clone_on_enqueue(&self) -> Option<&'a CloneRule<T>> {
        self.pick(|r| r.clone_on_enqueue.as_ref())
    }

    pub(crate) fn clone_on_dequeue(&self) -> Option<&'a CloneRule<T>> {
        self.pick(|r| r.clone_on_dequeue.as_ref())
    }
}
