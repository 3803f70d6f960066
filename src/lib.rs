//! nqs: per-key, priority-ordered, delayable work queues.
//!
//! This library provides a scheduling engine that dequeues items per key on a
//! fixed-rate tick, with pluggable storage (memory, append-only file, Redis
//! list, Redis sorted set with TTL eviction), a registry of named queues and a
//! typed administrative command surface.

pub mod cli;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use error::{CodecError, ConfigError, ControlError, QueueError, RegistryError, StorageError};
pub use registry::Registry;
pub use scheduler::{DequeueHandler, EnqueueResult, EnqueueResultCode, Queue, QueueBuilder};
