//! Per-queue worker task.
//!
//! The worker owns every piece of mutable scheduling state: rules, key
//! states, the ignore set, the priority list and the live pending counter.
//! It multiplexes four event sources:
//!
//! - administrative commands from [`Queue`] handles
//! - completion of the batch in flight
//! - the fixed-rate ticker (absent while paused)
//! - the auto-resume timer armed by `pause(Some(timeout))`
//!
//! A tick pops at most one key's batch and hands it to [`dispatch`]; the batch
//! is then polled alongside commands, which is what lets callbacks call back
//! into their own queue.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use super::dispatch::{self, Batch, BatchOutcome};
use super::queue::{Command, EnqueueOptions, Reply, EnqueueResult, EnqueueResultCode, Keys, Payload, Queue, QueueSettings, QueueStatus};
use super::rules::{Effective, KeyRules};
use crate::codec;
use crate::error::{QueueError, StorageError};
use crate::storage::{QueueItem, Storage};

/// Minimum delay between two idle reconciliations of the pending counter.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Scheduling state of one key.
pub(crate) struct KeyState<T> {
    pub rules: KeyRules<T>,
    /// Set when the key was last popped with an interval configured.
    pub locked_at: Option<Instant>,
    pub blocked: bool,
}

impl<T> Default for KeyState<T> {
    fn default() -> Self {
        Self {
            rules: KeyRules::default(),
            locked_at: None,
            blocked: false,
        }
    }
}

pub(crate) struct Worker<T> {
    name: Arc<str>,
    storage: Arc<dyn Storage>,
    gzip: bool,
    tick_interval: Duration,
    defaults: KeyRules<T>,
    keys: HashMap<String, KeyState<T>>,
    /// Known keys in discovery order.
    key_order: Vec<String>,
    priority: Vec<String>,
    ignore_not_prioritized: bool,
    randomize_priority: bool,
    ignored: HashSet<String>,
    pending: usize,
    last_reconciled: Option<Instant>,
    paused: bool,
    recovered: bool,
    autostart: bool,
    ticker: Option<Interval>,
    resume: Option<Pin<Box<Sleep>>>,
    batch: Option<BoxFuture<'static, BatchOutcome>>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
    handle: mpsc::WeakUnboundedSender<Command<T>>,
}

impl<T: Payload> Worker<T> {
    pub(crate) fn new(
        settings: QueueSettings<T>,
        commands: mpsc::UnboundedReceiver<Command<T>>,
        handle: mpsc::WeakUnboundedSender<Command<T>>,
    ) -> Self {
        let mut worker = Self {
            name: settings.name,
            storage: settings.storage,
            gzip: settings.gzip,
            tick_interval: settings.tick_interval,
            defaults: settings.defaults,
            keys: HashMap::new(),
            key_order: Vec::new(),
            priority: settings.priority,
            ignore_not_prioritized: settings.ignore_not_prioritized,
            randomize_priority: settings.randomize_priority,
            ignored: settings.ignored.into_iter().collect(),
            pending: 0,
            last_reconciled: None,
            paused: !settings.autostart,
            recovered: false,
            autostart: settings.autostart,
            ticker: None,
            resume: None,
            batch: None,
            commands,
            handle,
        };

        for (key, rules) in settings.key_rules {
            worker.key_state(&key).rules.merge(rules);
        }
        worker
    }

    /// Main worker loop; returns on shutdown or when every handle is gone.
    pub(crate) async fn run(mut self) {
        info!(queue = %self.name, storage = %self.storage.kind(), "Queue worker started");

        if self.autostart {
            self.start().await;
        }

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.drain_batch(vec![reply]).await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.drain_batch(Vec::new()).await;
                        break;
                    }
                },
                outcome = poll_batch(&mut self.batch) => {
                    self.batch = None;
                    self.finish_batch(outcome);
                }
                _ = poll_ticker(&mut self.ticker) => self.tick().await,
                _ = poll_resume(&mut self.resume) => {
                    self.resume = None;
                    info!(queue = %self.name, "Pause timeout elapsed, resuming");
                    self.start().await;
                }
            }
        }

        info!(queue = %self.name, "Queue worker stopped");
    }

    async fn handle_command(&mut self, command: Command<T>) {
        match command {
            Command::Enqueue {
                key,
                item,
                opts,
                reply,
            } => {
                let result = self.enqueue(key, item, opts).await;
                let _ = reply.send(result);
            }
            Command::Start { reply } => {
                self.start().await;
                let _ = reply.send(());
            }
            Command::Pause { timeout, reply } => {
                self.pause(timeout);
                let _ = reply.send(());
            }
            Command::Ignore { keys, reply } => {
                self.ignored.extend(keys);
                let _ = reply.send(());
            }
            Command::Restore { keys, reply } => {
                match keys {
                    Keys::All => self.ignored.clear(),
                    Keys::Only(keys) => {
                        for key in keys {
                            self.ignored.remove(&key);
                        }
                    }
                }
                let _ = reply.send(());
            }
            Command::Block { keys, reply } => {
                self.set_blocked(keys, true);
                let _ = reply.send(());
            }
            Command::Release { keys, reply } => {
                self.set_blocked(keys, false);
                let _ = reply.send(());
            }
            Command::Flush { keys, reply } => {
                let result = self.flush(keys).await;
                let _ = reply.send(result);
            }
            Command::SetDefaultRules { rules, reply } => {
                self.defaults.merge(rules);
                let _ = reply.send(());
            }
            Command::SetKeyRules { key, rules, reply } => {
                self.key_state(&key).rules.merge(rules);
                let _ = reply.send(());
            }
            Command::SetPriority {
                keys,
                ignore_not_prioritized,
                reply,
            } => {
                self.priority = keys;
                self.ignore_not_prioritized = ignore_not_prioritized;
                let _ = reply.send(());
            }
            Command::RandomizePriority { enabled, reply } => {
                self.randomize_priority = enabled;
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    /// Returns the state of `key`, registering it on first reference.
    fn key_state(&mut self, key: &str) -> &mut KeyState<T> {
        if !self.keys.contains_key(key) {
            debug!(queue = %self.name, key = %key, "Registering key");
            self.key_order.push(key.to_string());
        }
        self.keys.entry(key.to_string()).or_default()
    }

    fn handle(&self) -> Option<Queue<T>> {
        self.handle
            .upgrade()
            .map(|tx| Queue::from_parts(Arc::clone(&self.name), Arc::clone(&self.storage), tx))
    }

    async fn enqueue(
        &mut self,
        key: String,
        item: T,
        opts: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError> {
        if self.ignored.contains(&key) {
            return Ok(EnqueueResult::rejected(
                EnqueueResultCode::KeyIgnored,
                format!("Key '{}' is ignored", key),
            ));
        }

        if self.ignore_not_prioritized && !self.priority.contains(&key) {
            return Ok(EnqueueResult::rejected(
                EnqueueResultCode::KeyNotPrioritized,
                format!("Key '{}' is not in the priority list", key),
            ));
        }

        let effective = Effective::new(self.keys.get(&key).map(|s| &s.rules), &self.defaults);
        if effective.ignores(&item) {
            return Ok(EnqueueResult::rejected(
                EnqueueResultCode::MissingCondition,
                "Item rejected by the ignore-item rule",
            ));
        }

        let copies = effective
            .clone_on_enqueue()
            .map_or(1, |rule| rule.copies(&item));

        if opts.reject_if_blocked && self.keys.get(&key).is_some_and(|s| s.blocked) {
            return Ok(EnqueueResult::rejected(
                EnqueueResultCode::KeyBlocked,
                format!("Key '{}' is blocked", key),
            ));
        }

        let payload = codec::encode(&item, self.gzip)?;
        self.key_state(&key);

        for _ in 0..copies {
            self.storage
                .push(&key, QueueItem::now(payload.clone()))
                .await?;
            self.pending += 1;
        }
        debug!(queue = %self.name, key = %key, copies, pending = self.pending, "Item enqueued");

        if !self.paused {
            self.arm_ticker();
        }

        Ok(EnqueueResult::accepted(copies))
    }

    async fn start(&mut self) {
        self.paused = false;
        if self.resume.take().is_some() {
            debug!(queue = %self.name, "Cancelled pending auto-resume");
        }

        if !self.recovered {
            self.recovered = true;
            self.recover().await;
        }

        if self.ticker.is_none() {
            info!(queue = %self.name, pending = self.pending, "Queue started");
            self.arm_ticker();
        }
    }

    fn arm_ticker(&mut self) {
        if self.ticker.is_none() {
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            self.ticker = Some(ticker);
        }
    }

    fn pause(&mut self, timeout: Option<Duration>) {
        self.paused = true;
        self.ticker = None;
        self.resume = timeout.map(|t| Box::pin(tokio::time::sleep(t)));

        info!(
            queue = %self.name,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Queue paused"
        );
    }

    /// Registers keys found in storage and seeds the live counter.
    async fn recover(&mut self) {
        let counts = match self.storage.stored_count().await {
            Ok(counts) => counts,
            Err(e) => {
                error!(queue = %self.name, error = %e, "Recovery failed to read storage counts");
                return;
            }
        };

        let mut recovered_keys: Vec<_> = counts.into_iter().filter(|(_, n)| *n > 0).collect();
        recovered_keys.sort();

        let total: usize = recovered_keys.iter().map(|(_, n)| n).sum();
        for (key, _) in &recovered_keys {
            self.key_state(key);
        }
        self.pending = total;

        if total > 0 {
            info!(
                queue = %self.name,
                keys = recovered_keys.len(),
                pending = total,
                "Recovered pending items from storage"
            );
        }
    }

    fn set_blocked(&mut self, keys: Keys, blocked: bool) {
        match keys {
            Keys::All => {
                for state in self.keys.values_mut() {
                    state.blocked = blocked;
                }
            }
            Keys::Only(keys) => {
                for key in keys {
                    self.key_state(&key).blocked = blocked;
                }
            }
        }
    }

    async fn flush(&mut self, keys: Keys) -> Result<(), StorageError> {
        match keys {
            Keys::All => self.storage.flush(&[]).await?,
            // An empty selection means every key.
            Keys::Only(keys) => self.storage.flush(&keys).await?,
        }
        info!(queue = %self.name, "Flushed pending items");
        self.reconcile_pending().await;
        Ok(())
    }

    async fn reconcile_pending(&mut self) {
        self.last_reconciled = Some(Instant::now());
        match self.storage.stored_count().await {
            Ok(counts) => {
                let stored: usize = counts.values().sum();
                if stored != self.pending {
                    debug!(queue = %self.name, live = self.pending, stored, "Reconciled pending counter");
                }
                self.pending = stored;
            }
            Err(e) => warn!(queue = %self.name, error = %e, "Failed to reconcile pending counter"),
        }
    }

    /// Priority keys first (or every key shuffled), then the rest in
    /// discovery order.
    fn ordered_keys(&self) -> Vec<String> {
        let mut ordered: Vec<String> = if self.randomize_priority {
            let mut keys = self.key_order.clone();
            keys.shuffle(&mut rand::rng());
            keys
        } else {
            self.priority
                .iter()
                .filter(|k| self.keys.contains_key(*k))
                .cloned()
                .collect()
        };

        for key in &self.key_order {
            if !ordered.contains(key) {
                ordered.push(key.clone());
            }
        }
        ordered
    }

    async fn tick(&mut self) {
        if self.pending == 0 || self.batch.is_some() || !self.storage.is_ready() {
            return;
        }
        let Some(queue) = self.handle() else {
            return;
        };

        let mut drained_key = false;
        for key in self.ordered_keys() {
            let Some(state) = self.keys.get_mut(&key) else {
                continue;
            };
            if state.blocked {
                continue;
            }

            let effective = Effective::new(Some(&state.rules), &self.defaults);
            let Some(handler) = effective.on_dequeue().cloned() else {
                continue;
            };
            let interval = effective.dequeue_interval();

            if let Some(locked_at) = state.locked_at {
                match interval {
                    Some(interval) if locked_at.elapsed() < interval => continue,
                    _ => state.locked_at = None,
                }
            }

            let mode = effective.mode();
            let size = effective.dequeue_size();
            let max_retry = effective.max_retry();
            let on_max_retry = effective.on_max_retry().cloned();
            let clone_rule = effective.clone_on_dequeue().cloned();

            let popped = match self.storage.pop(mode, &key, size).await {
                Ok(popped) => popped,
                Err(e) => {
                    error!(queue = %self.name, key = %key, error = %e, "Failed to pop items");
                    continue;
                }
            };
            if popped.is_empty() {
                drained_key = true;
                continue;
            }

            if interval.is_some() {
                state.locked_at = Some(Instant::now());
            }

            let popped_count = popped.len();
            let mut items = Vec::with_capacity(popped_count);
            for raw in popped {
                match codec::decode::<T>(&raw.payload) {
                    Ok(item) => {
                        let copies = clone_rule.as_ref().map_or(1, |rule| rule.copies(&item));
                        items.extend(std::iter::repeat(item).take(copies));
                    }
                    Err(e) => {
                        error!(queue = %self.name, key = %key, error = %e, "Dropping undecodable item");
                    }
                }
            }

            debug!(
                queue = %self.name,
                key = %key,
                mode = %mode,
                popped = popped_count,
                deliveries = items.len(),
                "Dequeued batch"
            );

            self.batch = Some(dispatch::deliver(Batch {
                queue,
                key,
                items,
                popped: popped_count,
                handler,
                max_retry,
                on_max_retry,
            }));
            return;
        }

        // An eligible key came back empty, so the counter may be stale.
        let due = self
            .last_reconciled
            .map_or(true, |at| at.elapsed() >= RECONCILE_INTERVAL);
        if drained_key && due {
            self.reconcile_pending().await;
        }
    }

    fn finish_batch(&mut self, outcome: BatchOutcome) {
        self.pending = self.pending.saturating_sub(outcome.popped);

        if let Some(e) = outcome.error {
            error!(
                queue = %self.name,
                key = %outcome.key,
                delivered = outcome.delivered,
                dropped = outcome.popped.saturating_sub(outcome.delivered),
                error = %e,
                "Delivery failed after max retries, rest of batch dropped"
            );
        }
    }

    /// Waits for the batch in flight while still answering commands, so
    /// callbacks calling back into the queue can complete. Every shutdown
    /// request is acknowledged once the batch is done.
    async fn drain_batch(&mut self, mut shutdowns: Vec<Reply<()>>) {
        if let Some(mut batch) = self.batch.take() {
            let outcome = loop {
                tokio::select! {
                    biased;

                    outcome = &mut batch => break outcome,
                    command = self.commands.recv() => match command {
                        Some(Command::Shutdown { reply }) => shutdowns.push(reply),
                        Some(command) => self.handle_command(command).await,
                        None => break (&mut batch).await,
                    },
                }
            };
            self.finish_batch(outcome);
        }

        for reply in shutdowns {
            let _ = reply.send(());
        }
    }

    fn status(&self) -> QueueStatus {
        let sorted = |set: Vec<String>| {
            let mut set = set;
            set.sort();
            set
        };

        QueueStatus {
            name: self.name.to_string(),
            paused: self.paused,
            running: self.ticker.is_some(),
            batch_in_flight: self.batch.is_some(),
            pending: self.pending,
            keys: self.key_order.clone(),
            priority: self.priority.clone(),
            ignored: sorted(self.ignored.iter().cloned().collect()),
            blocked: sorted(
                self.keys
                    .iter()
                    .filter(|(_, s)| s.blocked)
                    .map(|(k, _)| k.clone())
                    .collect(),
            ),
            locked: sorted(
                self.keys
                    .iter()
                    .filter(|(_, s)| s.locked_at.is_some())
                    .map(|(k, _)| k.clone())
                    .collect(),
            ),
            default_mode: Effective::new(None, &self.defaults).mode(),
            modes: self
                .keys
                .iter()
                .map(|(k, s)| (k.clone(), Effective::new(Some(&s.rules), &self.defaults).mode()))
                .collect(),
        }
    }
}

async fn poll_batch(batch: &mut Option<BoxFuture<'static, BatchOutcome>>) -> BatchOutcome {
    match batch {
        Some(batch) => batch.await,
        None => std::future::pending().await,
    }
}

async fn poll_ticker(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn poll_resume(resume: &mut Option<Pin<Box<Sleep>>>) {
    match resume {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}
