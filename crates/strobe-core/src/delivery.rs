//! Per-subscriber delivery.
//!
//! Each subscription owns a [`Slot`]: its sender half guarded by a lock, plus
//! the lifecycle token. A delivery attempt and the subscription's teardown both
//! take the slot lock, so a message is either handed over before the channel
//! closes or not attempted at all.

use crate::config::DeliveryPolicy;
use crate::subscription::SubscriptionId;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Why a single delivery attempt did not hand over its message.
///
/// None of these are fatal; they are counted and logged by the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The subscription's channel was already closed.
    #[error("Subscription closed")]
    Closed,

    /// The subscription's lifecycle signal fired before the handoff.
    #[error("Subscription cancelled")]
    Cancelled,

    /// The subscriber did not make room within the delivery timeout.
    #[error("Delivery timed out after {0:?}")]
    TimedOut(Duration),
}

/// Delivery target for one subscription.
pub(crate) struct Slot<T> {
    id: SubscriptionId,
    token: CancellationToken,
    sender: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T: Send> Slot<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        token: CancellationToken,
        sender: mpsc::Sender<T>,
    ) -> Self {
        Self {
            id,
            token,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Attempt to hand `message` to the subscriber.
    ///
    /// Tries a non-blocking send first. If the channel is full, waits for room
    /// according to `policy`, giving up early if the lifecycle token fires.
    /// A bounded deadline also covers waiting for the slot lock behind earlier
    /// attempts to the same subscriber.
    pub(crate) async fn deliver(
        &self,
        message: T,
        policy: DeliveryPolicy,
    ) -> Result<(), DeliveryError> {
        match policy.timeout() {
            Some(limit) => time::timeout_at(Instant::now() + limit, self.handoff(message))
                .await
                .unwrap_or(Err(DeliveryError::TimedOut(limit))),
            None => self.handoff(message).await,
        }
    }

    async fn handoff(&self, message: T) -> Result<(), DeliveryError> {
        let guard = self.sender.lock().await;
        let sender = match guard.as_ref() {
            Some(_) if self.token.is_cancelled() => return Err(DeliveryError::Cancelled),
            Some(sender) => sender,
            None => return Err(DeliveryError::Closed),
        };

        let message = match sender.try_send(message) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(DeliveryError::Closed),
            Err(TrySendError::Full(message)) => message,
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(DeliveryError::Cancelled),
            res = sender.send(message) => res.map_err(|_| DeliveryError::Closed),
        }
    }

    /// Fire the lifecycle token, unregister, then close the channel.
    ///
    /// `unregister` runs at most once across all calls, while the slot lock is
    /// held and before the sender is dropped. Returns `false` if the slot was
    /// already closed.
    pub(crate) async fn close(&self, unregister: impl FnOnce()) -> bool {
        self.token.cancel();
        let mut sender = self.sender.lock().await;
        if sender.is_none() {
            return false;
        }
        unregister();
        drop(sender.take());
        true
    }
}
