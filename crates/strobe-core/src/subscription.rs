//! Subscription handles.
//!
//! A [`Subscription`] is a lease on future pulses. It owns the receiving half
//! of its delivery channel and the token that ends the lease. Closing (or
//! dropping) the handle fires the token; the broadcaster then unregisters the
//! subscription and closes the channel in the background, after which
//! [`Subscription::recv`] drains what is left and returns `None`.

use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Atomic counter handing out subscription identities.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric identity.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A caller's lease on messages pulsed by a [`Broadcaster`](crate::Broadcaster).
///
/// Messages arrive through [`recv`](Self::recv), [`try_recv`](Self::try_recv)
/// or the [`Stream`] impl. The channel receiver itself is never handed out, so
/// the only way to end the lease is [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriptionId,
    receiver: mpsc::Receiver<T>,
    token: CancellationToken,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        receiver: mpsc::Receiver<T>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            receiver,
            token,
        }
    }

    /// Get the subscription identity.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the subscription has been torn down and every
    /// message delivered before that has been read.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Receive a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] if nothing is queued, or
    /// [`TryRecvError::Disconnected`] once the subscription has been torn down
    /// and drained.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    /// End the subscription.
    ///
    /// Idempotent. Teardown completes asynchronously; pulses that have not yet
    /// handed over their message to this subscription are skipped.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether the lifecycle signal has fired.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
