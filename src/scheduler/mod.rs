//! Per-key, priority-ordered scheduling engine.
//!
//! This module turns a [`Storage`](crate::storage::Storage) into a queue that
//! dequeues on a fixed-rate tick:
//!
//! - **Queue**: cloneable handle; every operation is a message to the worker
//! - **QueueBuilder**: configures rules, priority and storage, then spawns
//! - **KeyRules**: mode, batch size, interval, retry and callbacks, per key or
//!   queue-wide
//!
//! # Architecture
//!
//! ```text
//!   Queue handle ──┐                    ┌──────────────┐
//!   Queue handle ──┼── mpsc commands ──▶│    Worker    │──▶ Storage
//!   callbacks    ──┘                    │ (owns state) │
//!                                       └──────┬───────┘
//!                                              │ one batch at a time
//!                                              ▼
//!                                     DequeueHandler (retry,
//!                                     then MaxRetryHandler)
//! ```
//!
//! # Tick
//!
//! Each tick visits keys in priority order (or shuffled), skipping keys that
//! are blocked, have no dequeue handler, or are still inside their dequeue
//! interval. The first key that yields items is locked (when an interval is
//! configured) and its batch is delivered; the next tick recomputes the order.
//!
//! # Gating
//!
//! - **Paused**: the whole queue has no ticker
//! - **Blocked**: one key is skipped until released
//! - **Locked**: one key is skipped until its interval elapses

mod dispatch;
mod engine;
pub mod queue;
pub mod rules;

pub use queue::{
    EnqueueOptions, EnqueueResult, EnqueueResultCode, Keys, Payload, Queue, QueueBuilder,
    QueueStatus, DEFAULT_TICK_INTERVAL, WILDCARD,
};
pub use rules::{CloneRule, DequeueContext, DequeueHandler, ItemPredicate, KeyRules, MaxRetryHandler};
