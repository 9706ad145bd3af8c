//! Delivery accounting for a broadcaster.
//!
//! Counters are kept locally for [`BroadcasterStats`] snapshots and mirrored
//! to the `metrics` facade. No exporter is installed here; whatever recorder
//! the host application sets up receives them.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod names {
    pub const SUBSCRIPTIONS_ACTIVE: &str = "strobe_subscriptions_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "strobe_subscriptions_total";
    pub const PULSES_TOTAL: &str = "strobe_pulses_total";
    pub const DELIVERIES_TOTAL: &str = "strobe_deliveries_total";
}

/// Describe all metrics emitted by this crate.
///
/// Optional; call once after installing a recorder to attach help text.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of registered subscriptions"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of subscriptions created"
    );
    metrics::describe_counter!(names::PULSES_TOTAL, "Total number of pulses broadcast");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Delivery attempts by outcome (delivered, skipped, timed_out)"
    );
}

/// Point-in-time broadcaster statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcasterStats {
    /// Subscriptions currently registered.
    pub active: usize,
    /// Subscriptions created since construction.
    pub subscribed: u64,
    /// Subscriptions torn down since construction.
    pub removed: u64,
    /// Pulses broadcast.
    pub pulses: u64,
    /// Delivery attempts started, one per subscription per pulse.
    pub attempted: u64,
    /// Messages handed to a subscriber channel.
    pub delivered: u64,
    /// Attempts skipped because the subscription was closing or closed.
    pub skipped: u64,
    /// Attempts abandoned after the delivery timeout.
    pub timed_out: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    subscribed: AtomicU64,
    removed: AtomicU64,
    pulses: AtomicU64,
    attempted: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
    timed_out: AtomicU64,
}

impl Counters {
    pub(crate) fn record_subscribe(&self) {
        self.subscribed.fetch_add(1, Ordering::Relaxed);
        counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
        gauge!(names::SUBSCRIPTIONS_ACTIVE).increment(1.0);
    }

    pub(crate) fn record_remove(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
        gauge!(names::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
    }

    pub(crate) fn record_pulse(&self, targets: usize) {
        self.pulses.fetch_add(1, Ordering::Relaxed);
        self.attempted.fetch_add(targets as u64, Ordering::Relaxed);
        counter!(names::PULSES_TOTAL).increment(1);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        counter!(names::DELIVERIES_TOTAL, "outcome" => "delivered").increment(1);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        counter!(names::DELIVERIES_TOTAL, "outcome" => "skipped").increment(1);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        counter!(names::DELIVERIES_TOTAL, "outcome" => "timed_out").increment(1);
    }

    pub(crate) fn snapshot(&self, active: usize) -> BroadcasterStats {
        BroadcasterStats {
            active,
            subscribed: self.subscribed.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            pulses: self.pulses.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
