//! Restart recovery on the append-only file backend.
//!
//! Items enqueued by one queue instance must be delivered by a later instance
//! opened on the same file, and queues sharing a file must stay isolated.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use nqs::scheduler::{DequeueContext, DequeueHandler, QueueBuilder};
use nqs::storage::{FileSystemStorage, SharedLogFile, Storage};

const TICK: Duration = Duration::from_millis(5);
const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    name: String,
}

fn job(id: u32) -> Job {
    Job {
        id,
        name: format!("job-{}", id),
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn collecting_handler(seen: &Arc<Mutex<Vec<Job>>>) -> DequeueHandler<Job> {
    let seen = Arc::clone(seen);
    DequeueHandler::awaited(move |job: Job, _ctx: DequeueContext<Job>| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().expect("lock").push(job);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_pending_items_survive_restart() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("queues.log");

    let storage = FileSystemStorage::open("jobs", &path).expect("open");
    let first = QueueBuilder::<Job>::new("jobs", Arc::new(storage))
        .with_tick_interval(TICK)
        .with_autostart(false)
        .build();
    for id in 1..=3 {
        let result = first.enqueue("tenant-a", job(id)).await.expect("enqueue");
        assert!(result.enqueued);
    }
    first.shutdown().await.expect("shutdown");
    drop(first);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let storage = FileSystemStorage::open("jobs", &path).expect("reopen");
    let second = QueueBuilder::<Job>::new("jobs", Arc::new(storage))
        .with_tick_interval(TICK)
        .with_on_dequeue(collecting_handler(&seen))
        .build();

    assert!(wait_until(WAIT, || seen.lock().expect("lock").len() == 3).await);
    let ids: Vec<u32> = seen.lock().expect("lock").iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(seen.lock().expect("lock")[0], job(1));

    let counts = second.storage_count().await.expect("count");
    assert_eq!(counts.values().sum::<usize>(), 0);
}

#[tokio::test]
async fn test_gzip_payloads_recovered() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("gzip.log");

    let storage = FileSystemStorage::open("zipped", &path).expect("open");
    let first = QueueBuilder::<Job>::new("zipped", Arc::new(storage))
        .with_gzip(true)
        .with_autostart(false)
        .build();
    first.enqueue("k", job(7)).await.expect("enqueue");
    first.shutdown().await.expect("shutdown");

    // Decoding detects compressed payloads, so the reader needs no gzip flag.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let storage = FileSystemStorage::open("zipped", &path).expect("reopen");
    let _second = QueueBuilder::<Job>::new("zipped", Arc::new(storage))
        .with_tick_interval(TICK)
        .with_on_dequeue(collecting_handler(&seen))
        .build();

    assert!(wait_until(WAIT, || seen.lock().expect("lock").len() == 1).await);
    assert_eq!(seen.lock().expect("lock")[0], job(7));
}

#[tokio::test]
async fn test_queues_sharing_a_file_are_isolated() {
    let dir = TempDir::new().expect("tempdir");
    let file = SharedLogFile::open(dir.path().join("shared.log")).expect("open");

    let left = FileSystemStorage::new("left", Arc::clone(&file)).expect("left");
    let right = FileSystemStorage::new("right", Arc::clone(&file)).expect("right");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let left_queue = QueueBuilder::<Job>::new("left", Arc::new(left))
        .with_tick_interval(TICK)
        .with_on_dequeue(collecting_handler(&seen))
        .build();
    let right_queue = QueueBuilder::<Job>::new("right", Arc::new(right))
        .with_tick_interval(TICK)
        .with_autostart(false)
        .build();

    right_queue.enqueue("k", job(2)).await.expect("enqueue");
    left_queue.enqueue("k", job(1)).await.expect("enqueue");

    assert!(wait_until(WAIT, || seen.lock().expect("lock").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().expect("lock").clone(), vec![job(1)]);

    let right_counts = right_queue.storage().stored_count().await.expect("count");
    assert_eq!(right_counts.get("k"), Some(&1));
}

#[tokio::test]
async fn test_payload_with_record_separator_is_delivered() {
    let dir = TempDir::new().expect("tempdir");
    let storage = FileSystemStorage::open("text", dir.path().join("text.log")).expect("open");
    let raw = format!("a{}b", nqs::storage::file_system::SEPARATOR);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        DequeueHandler::awaited(move |text: String, _ctx: DequeueContext<String>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().expect("lock").push(text);
                Ok(())
            }
        })
    };
    let queue = QueueBuilder::<String>::new("text", Arc::new(storage))
        .with_tick_interval(TICK)
        .with_on_dequeue(handler)
        .with_autostart(false)
        .build();

    queue.enqueue("k", raw.clone()).await.expect("enqueue");
    let counts = queue.storage_count().await.expect("count");
    assert_eq!(counts.get("k"), Some(&1));

    queue.start().await.expect("start");
    assert!(wait_until(WAIT, || seen.lock().expect("lock").len() == 1).await);
    assert_eq!(seen.lock().expect("lock").clone(), vec![raw]);
}
