//! The broadcaster: subscriber registry and fan-out.
//!
//! ```text
//!                         ┌──────────────► [slot S1] ──► Subscription 1
//!   pulse(m) ── snapshot ─┼──────────────► [slot S2] ──► Subscription 2
//!                         └──────────────► [slot SN] ──► Subscription N
//!                          (one task per slot)
//! ```
//!
//! `pulse` only reads the registry. Entries are added by `subscribe` and
//! removed by the per-subscription watcher once the lifecycle signal fires.

use crate::config::BroadcasterConfig;
use crate::delivery::{DeliveryError, Slot};
use crate::stats::{BroadcasterStats, Counters};
use crate::subscription::{Subscription, SubscriptionId};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outcome of a [`Broadcaster::pulse_and_wait`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseReport {
    /// Subscriptions enumerated for this pulse.
    pub attempted: usize,
    /// Subscriptions that received the message.
    pub delivered: usize,
    /// Subscriptions skipped because they were closing or closed.
    pub skipped: usize,
    /// Subscriptions abandoned after the delivery timeout.
    pub timed_out: usize,
}

struct Shared<T> {
    /// Registered subscriptions indexed by identity.
    subscriptions: DashMap<SubscriptionId, Arc<Slot<T>>>,
    config: BroadcasterConfig,
    counters: Arc<Counters>,
    /// Fired when the last broadcaster handle goes away.
    shutdown: CancellationToken,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Broadcast fan-out to every live subscription.
///
/// Cloning is cheap and yields another handle to the same registry. When the
/// last handle is dropped every remaining subscription is torn down.
///
/// `subscribe`, `subscribe_with` and `pulse` spawn Tokio tasks and must be
/// called from within a Tokio runtime.
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Create a new broadcaster with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BroadcasterConfig::default())
    }

    /// Create a new broadcaster with custom configuration.
    #[must_use]
    pub fn with_config(config: BroadcasterConfig) -> Self {
        debug!("Creating broadcaster with config: {:?}", config);
        Self {
            shared: Arc::new(Shared {
                subscriptions: DashMap::new(),
                config,
                counters: Arc::new(Counters::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &BroadcasterConfig {
        &self.shared.config
    }

    /// Register a new subscription that lives until it is closed or dropped.
    ///
    /// The subscription is counted by [`count`](Self::count) as soon as this
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn subscribe(&self) -> Subscription<T> {
        self.register(CancellationToken::new())
    }

    /// Register a new subscription bound to a caller-owned cancellation token.
    ///
    /// Cancelling `cancel` (or closing the returned handle) ends the
    /// subscription. Closing the handle does not cancel `cancel`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn subscribe_with(&self, cancel: &CancellationToken) -> Subscription<T> {
        self.register(cancel.child_token())
    }

    fn register(&self, token: CancellationToken) -> Subscription<T> {
        let id = SubscriptionId::next();
        let (sender, receiver) = mpsc::channel(self.shared.config.effective_capacity());
        let slot = Arc::new(Slot::new(id, token.clone(), sender));

        self.shared.subscriptions.insert(id, Arc::clone(&slot));
        self.shared.counters.record_subscribe();
        let active = self.shared.subscriptions.len();
        debug!(subscription = %id, subscribers = active, "Subscribed");

        self.spawn_watcher(slot);
        Subscription::new(id, receiver, token)
    }

    /// Tear the subscription down once its lifecycle signal fires.
    fn spawn_watcher(&self, slot: Arc<Slot<T>>) {
        let registry: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = slot.token().cancelled() => {}
                () = shutdown.cancelled() => {}
            }

            let id = slot.id();
            let closed = slot
                .close(|| {
                    if let Some(shared) = registry.upgrade() {
                        shared.subscriptions.remove(&id);
                        shared.counters.record_remove();
                        let active = shared.subscriptions.len();
                        debug!(subscription = %id, subscribers = active, "Unsubscribed");
                    }
                })
                .await;

            if closed {
                trace!(subscription = %id, "Subscription channel closed");
            }
        });
    }

    /// Broadcast a message to every subscription registered right now.
    ///
    /// Returns immediately; each delivery runs as its own task. Subscriptions
    /// added after this call starts are not attempted. Subscriptions closed
    /// before their attempt runs are skipped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn pulse(&self, message: T) {
        for (slot, message) in self.fan_out(message) {
            tokio::spawn(self.attempt(slot, message));
        }
    }

    /// Broadcast a message and wait for every delivery attempt to finish.
    ///
    /// Same delivery semantics as [`pulse`](Self::pulse). Dropping the
    /// returned future aborts attempts that have not finished.
    pub async fn pulse_and_wait(&self, message: T) -> PulseReport {
        let mut attempts = JoinSet::new();
        for (slot, message) in self.fan_out(message) {
            attempts.spawn(self.attempt(slot, message));
        }

        let mut report = PulseReport {
            attempted: attempts.len(),
            ..PulseReport::default()
        };

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(DeliveryError::TimedOut(_))) => report.timed_out += 1,
                Ok(Err(_)) => report.skipped += 1,
                Err(e) => {
                    warn!(error = %e, "Delivery task failed");
                    report.skipped += 1;
                }
            }
        }

        report
    }

    /// Snapshot the registry and pair each entry with its copy of `message`.
    fn fan_out(&self, message: T) -> Vec<(Arc<Slot<T>>, T)> {
        let targets: Vec<Arc<Slot<T>>> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        self.shared.counters.record_pulse(targets.len());
        trace!(subscribers = targets.len(), "Pulsing message");

        let mut pending = Vec::with_capacity(targets.len());
        let mut targets = targets.into_iter().peekable();
        while let Some(slot) = targets.next() {
            if targets.peek().is_some() {
                pending.push((slot, message.clone()));
            } else {
                pending.push((slot, message));
                break;
            }
        }
        pending
    }

    /// One delivery attempt, with accounting and diagnostics.
    fn attempt(
        &self,
        slot: Arc<Slot<T>>,
        message: T,
    ) -> impl std::future::Future<Output = Result<(), DeliveryError>> + Send + 'static {
        let policy = self.shared.config.delivery;
        let counters = Arc::clone(&self.shared.counters);

        async move {
            let result = slot.deliver(message, policy).await;
            match &result {
                Ok(()) => counters.record_delivered(),
                Err(DeliveryError::TimedOut(limit)) => {
                    counters.record_timed_out();
                    warn!(
                        subscription = %slot.id(),
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "Subscriber did not accept message in time, delivery abandoned"
                    );
                }
                Err(e) => {
                    counters.record_skipped();
                    trace!(subscription = %slot.id(), reason = %e, "Delivery skipped");
                }
            }
            result
        }
    }

    /// Get the number of registered subscriptions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// Check if there are no registered subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.subscriptions.is_empty()
    }

    /// Fire the lifecycle signal of every registered subscription.
    ///
    /// Caller-owned tokens passed to [`subscribe_with`](Self::subscribe_with)
    /// are left untouched. Teardown completes asynchronously.
    pub fn close_all(&self) {
        let mut closed = 0usize;
        for entry in self.shared.subscriptions.iter() {
            entry.value().token().cancel();
            closed += 1;
        }
        debug!(subscriptions = closed, "Closing all subscriptions");
    }

    /// Get broadcaster statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcasterStats {
        self.shared.counters.snapshot(self.count())
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscriptions", &self.shared.subscriptions.len())
            .field("config", &self.shared.config)
            .finish()
    }
}
