//! Typed administrative commands.
//!
//! Transports (an HTTP route layer, an interactive shell) translate their
//! requests into a [`Command`] and call [`execute`] against the registry. The
//! command set mirrors what those transports expose per queue name and
//! optional key.
//!
//! # Example
//!
//! ```rust,ignore
//! use nqs::control::{execute, Command, ItemKind, Response};
//!
//! let response = execute(&registry, Command::Enqueue {
//!     queue: "jobs".into(),
//!     key: "eu".into(),
//!     item: "42".into(),
//!     kind: ItemKind::Number,
//! }).await?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ControlError;
use crate::registry::{ManagedQueue, Registry};
use crate::scheduler::{EnqueueOptions, EnqueueResult, Keys};
use crate::storage::{Mode, StoredCount};

/// How the raw text of an enqueued item is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Json,
    Number,
    String,
}

impl FromStr for ItemKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ItemKind::Json),
            "number" => Ok(ItemKind::Number),
            "string" => Ok(ItemKind::String),
            other => Err(ControlError::UnknownItemKind(other.to_string())),
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Json => write!(f, "json"),
            ItemKind::Number => write!(f, "number"),
            ItemKind::String => write!(f, "string"),
        }
    }
}

impl ItemKind {
    /// Converts raw text into a JSON value according to the kind.
    pub fn parse_item(&self, raw: &str) -> Result<Value, ControlError> {
        let invalid = |reason: String| ControlError::InvalidItem {
            kind: self.to_string(),
            reason,
        };

        match self {
            ItemKind::Json => serde_json::from_str(raw).map_err(|e| invalid(e.to_string())),
            ItemKind::Number => {
                let raw = raw.trim();
                if let Ok(n) = raw.parse::<i64>() {
                    return Ok(Value::from(n));
                }
                let n: f64 = raw
                    .parse()
                    .map_err(|_| invalid(format!("'{}' is not a number", raw)))?;
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| invalid(format!("'{}' is not a finite number", raw)))
            }
            ItemKind::String => Ok(Value::String(raw.to_string())),
        }
    }
}

/// An administrative request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    List,
    Exists { queue: String },
    Paused { queue: String },
    /// Pause, optionally resuming after `time_ms`.
    Pause { queue: String, time_ms: Option<u64> },
    Start { queue: String },
    Ignore { queue: String, keys: Keys },
    Restore { queue: String, keys: Keys },
    Ignored { queue: String, key: String },
    Block { queue: String, keys: Keys },
    Release { queue: String, keys: Keys },
    Blocked { queue: String, key: String },
    Flush { queue: String, keys: Keys },
    /// Pending items per key, or for one key.
    Pending { queue: String, key: Option<String> },
    Mode { queue: String, key: Option<String> },
    Enqueue {
        queue: String,
        key: String,
        item: String,
        kind: ItemKind,
    },
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Done,
    Queues(Vec<String>),
    Flag(bool),
    Pending(StoredCount),
    Count(usize),
    Mode(Mode),
    Enqueue(EnqueueResult),
}

async fn find(registry: &Registry, name: &str) -> Result<Arc<dyn ManagedQueue>, ControlError> {
    registry
        .lookup(name)
        .await
        .ok_or_else(|| ControlError::QueueNotFound(name.to_string()))
}

/// Executes a command against the registry.
///
/// # Errors
///
/// Returns `ControlError::QueueNotFound` for unknown queues (except for
/// `Exists` and `Enqueue`, which report it in their response), and
/// `ControlError::InvalidItem` when an item cannot be parsed.
pub async fn execute(registry: &Registry, command: Command) -> Result<Response, ControlError> {
    match command {
        Command::Ping => Ok(Response::Pong),
        Command::List => Ok(Response::Queues(registry.list().await)),
        Command::Exists { queue } => Ok(Response::Flag(registry.contains(&queue).await)),
        Command::Paused { queue } => {
            let status = find(registry, &queue).await?.status().await?;
            Ok(Response::Flag(status.paused))
        }
        Command::Pause { queue, time_ms } => {
            let timeout = time_ms.map(Duration::from_millis);
            if let Some(t) = timeout.filter(|t| t.is_zero()) {
                return Err(ControlError::InvalidPause(t));
            }
            find(registry, &queue).await?.pause(timeout).await?;
            Ok(Response::Done)
        }
        Command::Start { queue } => {
            find(registry, &queue).await?.start().await?;
            Ok(Response::Done)
        }
        Command::Ignore { queue, keys } => {
            find(registry, &queue).await?.ignore_keys(keys).await?;
            Ok(Response::Done)
        }
        Command::Restore { queue, keys } => {
            find(registry, &queue).await?.restore_keys(keys).await?;
            Ok(Response::Done)
        }
        Command::Ignored { queue, key } => {
            let status = find(registry, &queue).await?.status().await?;
            Ok(Response::Flag(status.ignored.contains(&key)))
        }
        Command::Block { queue, keys } => {
            find(registry, &queue).await?.block(keys).await?;
            Ok(Response::Done)
        }
        Command::Release { queue, keys } => {
            find(registry, &queue).await?.release(keys).await?;
            Ok(Response::Done)
        }
        Command::Blocked { queue, key } => {
            let status = find(registry, &queue).await?.status().await?;
            Ok(Response::Flag(status.blocked.contains(&key)))
        }
        Command::Flush { queue, keys } => {
            find(registry, &queue).await?.flush(keys).await?;
            Ok(Response::Done)
        }
        Command::Pending { queue, key } => {
            let counts = find(registry, &queue).await?.storage_count().await?;
            match key {
                Some(key) => Ok(Response::Count(counts.get(&key).copied().unwrap_or(0))),
                None => Ok(Response::Pending(counts)),
            }
        }
        Command::Mode { queue, key } => {
            let status = find(registry, &queue).await?.status().await?;
            let mode = key
                .and_then(|k| status.modes.get(&k).copied())
                .unwrap_or(status.default_mode);
            Ok(Response::Mode(mode))
        }
        Command::Enqueue {
            queue,
            key,
            item,
            kind,
        } => {
            let value = kind.parse_item(&item)?;
            let opts = EnqueueOptions::default().with_throw_errors(false);
            let result = registry.enqueue(&queue, &key, value, opts).await?;
            Ok(Response::Enqueue(result))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{EnqueueResultCode, QueueBuilder};
    use crate::storage::MemoryStorage;

    async fn registry_with(name: &str) -> Registry {
        let registry = Registry::new();
        QueueBuilder::<Value>::new(name, Arc::new(MemoryStorage::new(name)))
            .with_autostart(false)
            .register(&registry)
            .await
            .expect("register");
        registry
    }

    #[test]
    fn test_item_kind_parsing() {
        assert_eq!("NUMBER".parse::<ItemKind>().expect("kind"), ItemKind::Number);
        assert!(matches!(
            "xml".parse::<ItemKind>(),
            Err(ControlError::UnknownItemKind(_))
        ));

        assert_eq!(ItemKind::Number.parse_item("42").expect("int"), Value::from(42));
        assert_eq!(ItemKind::Number.parse_item("1.5").expect("float"), Value::from(1.5));
        assert!(ItemKind::Number.parse_item("abc").is_err());
        assert_eq!(ItemKind::String.parse_item("42").expect("string"), Value::from("42"));
        assert_eq!(
            ItemKind::Json.parse_item(r#"{"a":1}"#).expect("json"),
            serde_json::json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn test_ping_list_exists() {
        let registry = registry_with("q").await;

        assert_eq!(execute(&registry, Command::Ping).await.expect("ping"), Response::Pong);
        assert_eq!(
            execute(&registry, Command::List).await.expect("list"),
            Response::Queues(vec!["q".to_string()])
        );
        assert_eq!(
            execute(&registry, Command::Exists { queue: "nope".into() })
                .await
                .expect("exists"),
            Response::Flag(false)
        );
        assert!(matches!(
            execute(&registry, Command::Paused { queue: "nope".into() }).await,
            Err(ControlError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_and_pending() {
        let registry = registry_with("q").await;

        let response = execute(
            &registry,
            Command::Enqueue {
                queue: "q".into(),
                key: "k".into(),
                item: "7".into(),
                kind: ItemKind::Number,
            },
        )
        .await
        .expect("enqueue");
        assert!(matches!(response, Response::Enqueue(ref r) if r.enqueued));

        let response = execute(
            &registry,
            Command::Pending {
                queue: "q".into(),
                key: Some("k".into()),
            },
        )
        .await
        .expect("pending");
        assert_eq!(response, Response::Count(1));

        let response = execute(
            &registry,
            Command::Enqueue {
                queue: "missing".into(),
                key: "k".into(),
                item: "x".into(),
                kind: ItemKind::String,
            },
        )
        .await
        .expect("enqueue");
        assert!(
            matches!(response, Response::Enqueue(ref r) if r.code == EnqueueResultCode::QueueNotFound)
        );
    }

    #[tokio::test]
    async fn test_ignore_block_and_pause_flags() {
        let registry = registry_with("q").await;

        execute(&registry, Command::Ignore { queue: "q".into(), keys: Keys::parse("a,b") })
            .await
            .expect("ignore");
        assert_eq!(
            execute(&registry, Command::Ignored { queue: "q".into(), key: "b".into() })
                .await
                .expect("ignored"),
            Response::Flag(true)
        );
        assert!(execute(&registry, Command::Ignore { queue: "q".into(), keys: Keys::All })
            .await
            .is_err());

        execute(&registry, Command::Block { queue: "q".into(), keys: Keys::one("c") })
            .await
            .expect("block");
        assert_eq!(
            execute(&registry, Command::Blocked { queue: "q".into(), key: "c".into() })
                .await
                .expect("blocked"),
            Response::Flag(true)
        );

        // Built without autostart.
        assert_eq!(
            execute(&registry, Command::Paused { queue: "q".into() })
                .await
                .expect("paused"),
            Response::Flag(true)
        );
        execute(&registry, Command::Start { queue: "q".into() })
            .await
            .expect("start");
        assert_eq!(
            execute(&registry, Command::Paused { queue: "q".into() })
                .await
                .expect("paused"),
            Response::Flag(false)
        );

        assert!(matches!(
            execute(&registry, Command::Pause { queue: "q".into(), time_ms: Some(0) }).await,
            Err(ControlError::InvalidPause(_))
        ));
    }

    #[tokio::test]
    async fn test_mode_defaults_to_fifo() {
        let registry = registry_with("q").await;
        let response = execute(&registry, Command::Mode { queue: "q".into(), key: None })
            .await
            .expect("mode");
        assert_eq!(response, Response::Mode(Mode::Fifo));
    }
}
