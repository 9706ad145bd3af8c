//! Shared helpers for the Strobe benchmarks and the `stress` tool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strobe_core::{Broadcaster, BroadcasterStats};
use tokio::task::JoinHandle;

/// Spawn `count` subscribers that read until closed.
///
/// Every received message bumps `received`. Each handle resolves to the number
/// of messages that consumer saw.
pub fn spawn_consumers<T: Clone + Send + 'static>(
    broadcaster: &Broadcaster<T>,
    count: usize,
    received: &Arc<AtomicU64>,
) -> Vec<JoinHandle<u64>> {
    (0..count)
        .map(|_| {
            let mut sub = broadcaster.subscribe();
            let received = Arc::clone(received);
            tokio::spawn(async move {
                let mut seen = 0u64;
                while sub.recv().await.is_some() {
                    seen += 1;
                    received.fetch_add(1, Ordering::Relaxed);
                }
                seen
            })
        })
        .collect()
}

/// Whether every started delivery attempt has finished.
#[must_use]
pub fn settled(stats: &BroadcasterStats) -> bool {
    stats.delivered + stats.skipped + stats.timed_out >= stats.attempted
}

/// Poll until all fire-and-forget deliveries have finished.
pub async fn wait_settled<T: Clone + Send + 'static>(
    broadcaster: &Broadcaster<T>,
) -> BroadcasterStats {
    loop {
        let stats = broadcaster.stats();
        if settled(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
