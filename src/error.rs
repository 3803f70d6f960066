//! Error types for nqs operations.
//!
//! Defines error types for each subsystem:
//! - Payload encoding and decoding
//! - Storage backends (memory, file, Redis)
//! - The per-queue scheduling engine
//! - The queue registry and its admin command surface
//! - Configuration loading

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while encoding or decoding item payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Gzip stream error: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload is not valid UTF-8 text")]
    NotText,
}

/// Errors that can occur inside a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Corrupt record in '{source_name}': {reason}")]
    CorruptRecord { source_name: String, reason: String },
}

/// Errors returned by the scheduling engine.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("'*' cannot be used as a key (it refers to all keys)")]
    ReservedKey,

    #[error("'*' is not allowed here: {0}")]
    WildcardNotAllowed(&'static str),

    #[error("Queue '{0}' worker has stopped")]
    WorkerStopped(String),

    #[error("Item for queue '{queue}' could not be converted: {reason}")]
    InvalidItem { queue: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Cannot create 2 queues with the same name: '{0}'")]
    Duplicate(String),

    #[error("Queue '{0}' not found")]
    NotFound(String),
}

/// Errors that can occur while executing an admin command.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    #[error("Invalid item for kind '{kind}': {reason}")]
    InvalidItem { kind: String, reason: String },

    #[error("Unknown item kind '{0}': must be 'json', 'number' or 'string'")]
    UnknownItemKind(String),

    #[error("Invalid pause time: {0:?}")]
    InvalidPause(Duration),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}' in queue '{queue}': {reason}")]
    InvalidValue {
        queue: String,
        field: String,
        reason: String,
    },

    #[error("Queue '{0}' is declared more than once")]
    DuplicateQueue(String),

    #[error("Failed to initialize storage for queue '{queue}': {source}")]
    Storage {
        queue: String,
        source: StorageError,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::Duplicate("q1".to_string());
        assert!(err.to_string().contains("same name"));
        assert!(err.to_string().contains("q1"));

        let err = RegistryError::NotFound("q2".to_string());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_queue_error_from_storage() {
        let err: QueueError = StorageError::InvalidKey {
            key: "a\nb".to_string(),
            reason: "contains a newline".to_string(),
        }
        .into();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(err.to_string().contains("newline"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            queue: "q1".to_string(),
            field: "dequeue_size".to_string(),
            reason: "must be greater than zero".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("dequeue_size"));
        assert!(message.contains("q1"));
    }
}
