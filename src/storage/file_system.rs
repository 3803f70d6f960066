//! Append-only log file storage backend.
//!
//! All queues pointing at the same file share it: every record carries the
//! queue name, the key, the push timestamp and the payload, separated by a
//! multi-character separator:
//!
//! ```text
//! queueName§nqs§sep§key§nqs§sep§1700000000000§nqs§sep§{"id":1}§nqs§sep§\n
//! ```
//!
//! Queue names and keys containing the separator are rejected. JSON strings
//! may legally contain it, so such payloads are written base64 encoded behind
//! a `b64:` prefix, which no JSON document can start with.
//!
//! Pushes append one line. Pops and flushes read the whole file, drop the
//! selected records and rewrite it through a temporary file, so every
//! operation is O(file size). This trades throughput for zero extra
//! infrastructure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Mode, QueueItem, Storage, StorageKind, StoredCount};
use crate::codec;
use crate::error::{CodecError, StorageError};

/// Field separator inside a record.
pub const SEPARATOR: &str = "§nqs§sep§";

/// Prefix of payloads stored base64 encoded.
const ESCAPED_PREFIX: &str = "b64:";

/// A log file plus the lock serializing access to it within this process.
///
/// Queues sharing a file must share the same `SharedLogFile` so that their
/// read-modify-write cycles never interleave.
#[derive(Debug)]
pub struct SharedLogFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SharedLogFile {
    /// Opens (creating if needed) a log file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Arc::new(Self {
            path,
            lock: Mutex::new(()),
        }))
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch file used while rewriting, next to the log itself.
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".nqs-tmp");
        PathBuf::from(name)
    }
}

/// One parsed line of the log.
struct Record<'a> {
    queue: &'a str,
    key: &'a str,
    push_timestamp: i64,
    payload: &'a str,
}

impl<'a> Record<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let mut fields = line.split(SEPARATOR);
        let queue = fields.next()?;
        let key = fields.next()?;
        let push_timestamp = fields.next()?.parse().ok()?;
        let payload = fields.next()?;
        // A well-formed line ends with a separator, leaving one empty field.
        match (fields.next(), fields.next()) {
            (Some(""), None) => Some(Self {
                queue,
                key,
                push_timestamp,
                payload,
            }),
            _ => None,
        }
    }

    fn to_item(&self) -> Result<QueueItem, StorageError> {
        Ok(QueueItem::with_timestamp(
            self.push_timestamp,
            payload_bytes(self.payload)?,
        ))
    }
}

fn payload_field(bytes: &[u8]) -> Result<String, StorageError> {
    let text = codec::to_text(bytes)?;
    if text.contains(SEPARATOR) || text.contains('\n') {
        return Ok(format!("{ESCAPED_PREFIX}{}", STANDARD.encode(bytes)));
    }
    Ok(text)
}

fn payload_bytes(field: &str) -> Result<Vec<u8>, StorageError> {
    match field.strip_prefix(ESCAPED_PREFIX) {
        Some(encoded) => Ok(STANDARD.decode(encoded).map_err(CodecError::from)?),
        None => Ok(codec::from_text(field)?),
    }
}

fn format_record(queue: &str, key: &str, item: &QueueItem) -> Result<String, StorageError> {
    let payload = payload_field(&item.payload)?;
    Ok(format!(
        "{queue}{SEPARATOR}{key}{SEPARATOR}{ts}{SEPARATOR}{payload}{SEPARATOR}\n",
        ts = item.push_timestamp
    ))
}

fn validate_field(field: &str, what: &str) -> Result<(), StorageError> {
    let reason = if field.contains(SEPARATOR) {
        "contains the record separator"
    } else if field.contains('\n') {
        "contains a newline"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        key: field.to_string(),
        reason: format!("{what} {reason}"),
    })
}

/// Storage backed by a shared append-only file.
pub struct FileSystemStorage {
    name: String,
    file: Arc<SharedLogFile>,
}

impl FileSystemStorage {
    /// Creates a storage for `name` over an already opened log file.
    pub fn new(name: impl Into<String>, file: Arc<SharedLogFile>) -> Result<Self, StorageError> {
        let name = name.into();
        validate_field(&name, "queue name")?;
        Ok(Self { name, file })
    }

    /// Opens `path` and creates a storage over it.
    ///
    /// Use [`FileSystemStorage::new`] with a shared [`SharedLogFile`] when
    /// several queues write to the same file.
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(name, SharedLogFile::open(path)?)
    }

    async fn read_lines(&self) -> Result<String, StorageError> {
        match tokio::fs::read_to_string(&self.file.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rewrite(&self, lines: &[&str]) -> Result<(), StorageError> {
        let mut content = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }

        let tmp_path = self.file.temp_path();
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.file.path).await?;
        Ok(())
    }

    /// Removes up to `count` records of `key`, oldest or newest first.
    async fn take(&self, mode: Mode, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.file.lock.lock().await;
        let content = self.read_lines().await?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let matching: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| {
                Record::parse(line)
                    .filter(|r| r.queue == self.name && r.key == key)
                    .map(|_| idx)
            })
            .collect();

        let selected: Vec<usize> = match mode {
            Mode::Fifo => matching.iter().take(count).copied().collect(),
            Mode::Lifo => matching.iter().rev().take(count).copied().collect(),
        };
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = Vec::with_capacity(selected.len());
        for &idx in &selected {
            // Parsed successfully while selecting.
            if let Some(record) = Record::parse(lines[idx]) {
                items.push(record.to_item()?);
            }
        }

        let remaining: Vec<&str> = lines
            .iter()
            .enumerate()
            .filter(|(idx, _)| !selected.contains(idx))
            .map(|(_, line)| *line)
            .collect();
        self.rewrite(&remaining).await?;

        debug!(
            queue = %self.name,
            key = %key,
            popped = items.len(),
            "Popped records from log file"
        );
        Ok(items)
    }
}

#[async_trait]
impl Storage for FileSystemStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StorageKind {
        StorageKind::FileSystem
    }

    async fn push(&self, key: &str, item: QueueItem) -> Result<(), StorageError> {
        validate_field(key, "key")?;
        let line = format_record(&self.name, key, &item)?;

        let _guard = self.file.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn pop_right(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        self.take(Mode::Fifo, key, count).await
    }

    async fn pop_left(&self, key: &str, count: usize) -> Result<Vec<QueueItem>, StorageError> {
        self.take(Mode::Lifo, key, count).await
    }

    async fn stored_count(&self) -> Result<StoredCount, StorageError> {
        let _guard = self.file.lock.lock().await;
        let content = self.read_lines().await?;

        let mut counts: StoredCount = HashMap::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            match Record::parse(line) {
                Some(record) if record.queue == self.name => {
                    *counts.entry(record.key.to_string()).or_insert(0) += 1;
                }
                Some(_) => {}
                None => warn!(
                    path = %self.file.path.display(),
                    "Skipping malformed record in log file"
                ),
            }
        }
        Ok(counts)
    }

    async fn flush(&self, keys: &[String]) -> Result<(), StorageError> {
        let _guard = self.file.lock.lock().await;
        let content = self.read_lines().await?;

        let remaining: Vec<&str> = content
            .lines()
            .filter(|l| !l.is_empty())
            .filter(|line| match Record::parse(line) {
                Some(r) if r.queue == self.name => {
                    !(keys.is_empty() || keys.iter().any(|k| k == r.key))
                }
                _ => true,
            })
            .collect();

        self.rewrite(&remaining).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(ts: i64, json: &str) -> QueueItem {
        QueueItem::with_timestamp(ts, json.as_bytes().to_vec())
    }

    fn storage_in(dir: &TempDir, name: &str) -> FileSystemStorage {
        FileSystemStorage::open(name, dir.path().join("queue.log")).expect("open")
    }

    #[test]
    fn test_record_parse() {
        let line = format!("q1{SEPARATOR}k1{SEPARATOR}12{SEPARATOR}{{\"a\":1}}{SEPARATOR}");
        let record = Record::parse(&line).expect("should parse");
        assert_eq!(record.queue, "q1");
        assert_eq!(record.key, "k1");
        assert_eq!(record.push_timestamp, 12);
        assert_eq!(record.payload, "{\"a\":1}");

        assert!(Record::parse("garbage").is_none());
        assert!(Record::parse(&format!("q1{SEPARATOR}k1{SEPARATOR}nan{SEPARATOR}1{SEPARATOR}")).is_none());
    }

    #[tokio::test]
    async fn test_fifo_and_lifo_order() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage_in(&dir, "q1");
        for (ts, v) in [(1, "1"), (2, "2"), (3, "3"), (4, "4")] {
            storage.push("k1", item(ts, v)).await.expect("push");
        }

        let oldest = storage.pop_right("k1", 2).await.expect("pop");
        assert_eq!(oldest, vec![item(1, "1"), item(2, "2")]);

        let newest = storage.pop_left("k1", 1).await.expect("pop");
        assert_eq!(newest, vec![item(4, "4")]);

        let count = storage.stored_count().await.expect("count");
        assert_eq!(count.get("k1"), Some(&1));
    }

    #[tokio::test]
    async fn test_shared_file_is_partitioned_by_queue() {
        let dir = TempDir::new().expect("tempdir");
        let file = SharedLogFile::open(dir.path().join("shared.log")).expect("open");
        let a = FileSystemStorage::new("a", Arc::clone(&file)).expect("storage");
        let b = FileSystemStorage::new("b", Arc::clone(&file)).expect("storage");

        a.push("k", item(1, "\"a1\"")).await.expect("push");
        b.push("k", item(2, "\"b1\"")).await.expect("push");
        a.push("k", item(3, "\"a2\"")).await.expect("push");

        let popped = b.pop_right("k", 10).await.expect("pop");
        assert_eq!(popped, vec![item(2, "\"b1\"")]);

        let count = a.stored_count().await.expect("count");
        assert_eq!(count.get("k"), Some(&2));
        assert!(b.stored_count().await.expect("count").is_empty());
    }

    #[tokio::test]
    async fn test_flush_selected_keys() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage_in(&dir, "q1");
        storage.push("k1", item(1, "1")).await.expect("push");
        storage.push("k2", item(2, "2")).await.expect("push");

        storage.flush(&["k1".to_string()]).await.expect("flush");
        let count = storage.stored_count().await.expect("count");
        assert_eq!(count.get("k1"), None);
        assert_eq!(count.get("k2"), Some(&1));

        storage.flush(&[]).await.expect("flush");
        assert!(storage.stored_count().await.expect("count").is_empty());
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let storage = storage_in(&dir, "q1");
            storage.push("k1", item(1, "[1]")).await.expect("push");
        }

        let reopened = storage_in(&dir, "q1");
        let popped = reopened.pop_right("k1", 1).await.expect("pop");
        assert_eq!(popped, vec![item(1, "[1]")]);
    }

    #[tokio::test]
    async fn test_payload_containing_separator_is_kept() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage_in(&dir, "q1");
        let json = serde_json::to_vec(&format!("a{SEPARATOR}b")).expect("json");
        storage.push("k1", item(1, "0")).await.expect("push");
        storage
            .push("k1", QueueItem::with_timestamp(2, json.clone()))
            .await
            .expect("push");

        let count = storage.stored_count().await.expect("count");
        assert_eq!(count.get("k1"), Some(&2));

        let popped = storage.pop_right("k1", 2).await.expect("pop");
        assert_eq!(popped, vec![item(1, "0"), QueueItem::with_timestamp(2, json)]);
    }

    #[test]
    fn test_temp_path_keeps_full_file_name() {
        let dir = TempDir::new().expect("tempdir");
        let log = SharedLogFile::open(dir.path().join("queues.log")).expect("open");
        let txt = SharedLogFile::open(dir.path().join("queues.txt")).expect("open");

        assert_eq!(log.temp_path(), dir.path().join("queues.log.nqs-tmp"));
        assert_ne!(log.temp_path(), txt.temp_path());
    }

    #[tokio::test]
    async fn test_key_with_newline_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage_in(&dir, "q1");
        let err = storage.push("bad\nkey", item(1, "1")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }
}
