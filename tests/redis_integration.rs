//! Integration tests for the Redis storage backends.
//!
//! These tests require a running Redis server. Set `REDIS_URL` (for example
//! `redis://127.0.0.1:6379`) and run with:
//!
//! ```bash
//! cargo test --test redis_integration -- --ignored
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use nqs::scheduler::{DequeueContext, DequeueHandler, QueueBuilder};
use nqs::storage::{Mode, QueueItem, RedisListStorage, RedisSetStorage, Storage};

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL environment variable must be set for integration tests")
}

/// Queue name unique to one test run so that runs never see each other's keys.
fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Single-digit JSON payload.
fn item(n: u8) -> QueueItem {
    QueueItem::now(vec![b'0' + n])
}

fn item_at(timestamp: i64, n: u8) -> QueueItem {
    QueueItem::with_timestamp(timestamp, vec![b'0' + n])
}

fn payloads(items: &[QueueItem]) -> Vec<u8> {
    items.iter().map(|i| i.payload[0] - b'0').collect()
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_list_fifo_and_lifo() {
    let name = unique_name("list");
    let storage = RedisListStorage::connect(&name, &get_redis_url())
        .await
        .expect("Failed to connect to Redis");

    for n in 1..=4 {
        storage.push("k", item(n)).await.expect("push");
    }

    let oldest = storage.pop(Mode::Fifo, "k", 2).await.expect("pop");
    assert_eq!(payloads(&oldest), vec![1, 2]);

    let newest = storage.pop(Mode::Lifo, "k", 1).await.expect("pop");
    assert_eq!(payloads(&newest), vec![4]);

    let counts = storage.stored_count().await.expect("count");
    assert_eq!(counts.get("k"), Some(&1));

    storage.flush(&[]).await.expect("flush");
    assert!(storage.stored_count().await.expect("count").is_empty());
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_list_count_skips_foreign_key_types() {
    let name = unique_name("foreign");
    let storage = RedisListStorage::connect(&name, &get_redis_url())
        .await
        .expect("Failed to connect to Redis");

    let client = redis::Client::open(get_redis_url()).expect("client");
    let mut conn = ConnectionManager::new(client).await.expect("connection");
    let foreign = format!("nqs:{}:list:foreign", name);
    conn.set::<_, _, ()>(&foreign, "not a list").await.expect("set");

    storage.push("k", item(1)).await.expect("push");
    let counts = storage.stored_count().await.expect("count must skip the string key");
    assert_eq!(counts.get("k"), Some(&1));
    assert_eq!(counts.get("foreign"), None);

    conn.del::<_, ()>(&foreign).await.expect("del");
    storage.flush(&[]).await.expect("flush");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_queue_names_with_separators_stay_isolated() {
    let base = unique_name("outer");
    let nested = format!("{}:list:inner", base);
    let outer = RedisListStorage::connect(&base, &get_redis_url())
        .await
        .expect("Failed to connect to Redis");
    let inner = RedisListStorage::connect(&nested, &get_redis_url())
        .await
        .expect("Failed to connect to Redis");

    inner.push("k", item(1)).await.expect("push");
    assert!(outer.stored_count().await.expect("count").is_empty());
    assert_eq!(inner.stored_count().await.expect("count").get("k"), Some(&1));

    outer.flush(&[]).await.expect("flush");
    assert_eq!(inner.stored_count().await.expect("count").get("k"), Some(&1));
    inner.flush(&[]).await.expect("flush");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_sorted_set_orders_by_timestamp() {
    let name = unique_name("zset");
    let storage = RedisSetStorage::connect(&name, &get_redis_url(), None)
        .await
        .expect("Failed to connect to Redis");
    assert!(storage.is_ready(), "storage without TTL is ready immediately");

    storage.push("k", item_at(3_000, 3)).await.expect("push");
    storage.push("k", item_at(1_000, 1)).await.expect("push");
    storage.push("k", item_at(2_000, 2)).await.expect("push");

    let oldest = storage.pop(Mode::Fifo, "k", 2).await.expect("pop");
    assert_eq!(payloads(&oldest), vec![1, 2]);

    let newest = storage.pop(Mode::Lifo, "k", 5).await.expect("pop");
    assert_eq!(payloads(&newest), vec![3]);

    storage.flush(&[]).await.expect("flush");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_sorted_set_ttl_eviction() {
    let name = unique_name("ttl");
    let storage = RedisSetStorage::connect(&name, &get_redis_url(), Some(Duration::from_millis(500)))
        .await
        .expect("Failed to connect to Redis");

    let deadline = Instant::now() + Duration::from_secs(2);
    while !storage.is_ready() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(storage.is_ready(), "startup sweep should complete");

    storage.push("k", item(1)).await.expect("push");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let counts = storage.stored_count().await.expect("count");
    assert_eq!(counts.get("k"), Some(&1), "item must survive inside its TTL");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let counts = storage.stored_count().await.expect("count");
    assert_eq!(counts.get("k").copied().unwrap_or(0), 0, "item must be evicted after its TTL");

    storage.flush(&[]).await.expect("flush");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_queue_over_redis_list() {
    let name = unique_name("queue");
    let storage = RedisListStorage::connect(&name, &get_redis_url())
        .await
        .expect("Failed to connect to Redis");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        DequeueHandler::awaited(move |n: u32, ctx: DequeueContext<u32>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().expect("lock").push((ctx.key, n));
                Ok(())
            }
        })
    };

    let queue = QueueBuilder::<u32>::new(&name, Arc::new(storage))
        .with_tick_interval(Duration::from_millis(5))
        .with_priority(["high"])
        .with_on_dequeue(handler)
        .with_autostart(false)
        .build();

    queue.enqueue("low", 1).await.expect("enqueue");
    queue.enqueue("high", 2).await.expect("enqueue");
    queue.start().await.expect("start");

    let deadline = Instant::now() + Duration::from_secs(3);
    while seen.lock().expect("lock").len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = seen.lock().expect("lock").clone();
    assert_eq!(seen, vec![("high".to_string(), 2), ("low".to_string(), 1)]);

    queue.shutdown().await.expect("shutdown");
}
