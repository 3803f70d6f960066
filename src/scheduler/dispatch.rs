//! Batch delivery with retry.
//!
//! A batch is the set of items popped for one key in one tick, already
//! decoded and expanded by the clone-on-dequeue rule. Awaited handlers see the
//! items one at a time, in pop order. Detached handlers are spawned as soon as
//! the batch is polled and report failures through the log only.

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, warn};

use super::queue::{Payload, Queue};
use super::rules::{DequeueContext, DequeueHandler, MaxRetryHandler};

/// Items popped for one key, ready for delivery.
pub(crate) struct Batch<T> {
    pub queue: Queue<T>,
    pub key: String,
    pub items: Vec<T>,
    /// Number of stored items the batch was built from.
    pub popped: usize,
    pub handler: DequeueHandler<T>,
    pub max_retry: u32,
    pub on_max_retry: Option<MaxRetryHandler<T>>,
}

/// What happened to a batch.
#[derive(Debug)]
pub(crate) struct BatchOutcome {
    pub key: String,
    pub popped: usize,
    /// Deliveries completed (or dispatched, for detached handlers).
    pub delivered: usize,
    /// Set when an awaited delivery failed without a max-retry hook.
    pub error: Option<anyhow::Error>,
}

/// Turns a batch into a future the worker polls to completion.
pub(crate) fn deliver<T: Payload>(batch: Batch<T>) -> BoxFuture<'static, BatchOutcome> {
    async move {
        let Batch {
            queue,
            key,
            items,
            popped,
            handler,
            max_retry,
            on_max_retry,
        } = batch;

        let mut delivered = 0;
        let mut failure = None;

        for item in items {
            let delivery = Delivery {
                queue: queue.clone(),
                key: key.clone(),
                handler: handler.clone(),
                max_retry,
                on_max_retry: on_max_retry.clone(),
            };

            if handler.is_awaited() {
                match delivery.run(item).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            } else {
                tokio::spawn(async move {
                    let queue = delivery.queue.name().to_string();
                    let key = delivery.key.clone();
                    if let Err(e) = delivery.run(item).await {
                        error!(queue = %queue, key = %key, error = %e, "Detached delivery failed after max retries");
                    }
                });
                delivered += 1;
            }
        }

        BatchOutcome {
            key,
            popped,
            delivered,
            error: failure,
        }
    }
    .boxed()
}

/// Delivery of a single item with its retry policy.
struct Delivery<T> {
    queue: Queue<T>,
    key: String,
    handler: DequeueHandler<T>,
    max_retry: u32,
    on_max_retry: Option<MaxRetryHandler<T>>,
}

impl<T: Payload> Delivery<T> {
    fn context(&self, attempt: u32) -> DequeueContext<T> {
        DequeueContext {
            queue: self.queue.clone(),
            key: self.key.clone(),
            attempt,
        }
    }

    /// Calls the handler up to `max_retry` times, then the max-retry hook.
    ///
    /// Returns the last handler error only when no hook is configured.
    async fn run(self, item: T) -> anyhow::Result<()> {
        let attempts = self.max_retry.max(1);
        let mut attempt = 1;

        let error = loop {
            match self.handler.call(item.clone(), self.context(attempt)).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        queue = %self.queue.name(),
                        key = %self.key,
                        attempt,
                        max_retry = attempts,
                        error = %e,
                        "Dequeue handler failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        let Some(hook) = &self.on_max_retry else {
            return Err(error);
        };

        warn!(
            queue = %self.queue.name(),
            key = %self.key,
            attempts,
            error = %error,
            "Max retries reached, calling max-retry handler"
        );

        let call = hook.call(error, item, self.context(attempt));
        if hook.is_awaited() {
            call.await;
        } else {
            tokio::spawn(call);
        }
        Ok(())
    }
}
