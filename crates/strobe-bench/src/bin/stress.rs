//! Concurrent subscribe/close/pulse load for Strobe.
//!
//! Registers a set of subscribers, half of which close themselves at a random
//! point, while several publishers fire pulses concurrently. Verifies that no
//! subscriber receives a message pulsed after it closed and that every
//! subscription is torn down at the end.
//!
//! ```bash
//! # 1000 subscribers, 10000 pulses, default config
//! cargo run --release --bin stress
//!
//! # Custom sizes and a config file
//! RUST_LOG=strobe=debug cargo run --release --bin stress -- 500 2000 strobe.toml
//! ```

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strobe_bench::wait_settled;
use strobe_core::{Broadcaster, BroadcasterConfig};
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PUBLISHERS: u64 = 8;

struct Consumer {
    survivor: bool,
    received: u64,
    late: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strobe=info,stress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let subscribers: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1_000);
    let pulses: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let config = match args.get(3) {
        Some(path) => BroadcasterConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {path}"))?,
        None => BroadcasterConfig::default(),
    };

    info!(subscribers, pulses, ?config, "Starting stress run");

    let broadcaster = Broadcaster::<u64>::with_config(config);
    let sequence = Arc::new(AtomicU64::new(0));

    let mut consumers = JoinSet::new();
    for _ in 0..subscribers {
        let mut sub = broadcaster.subscribe();
        let sequence = Arc::clone(&sequence);
        let close_after = {
            let mut rng = rand::thread_rng();
            rng.gen_bool(0.5).then(|| rng.gen_range(1..=pulses.max(1)))
        };

        consumers.spawn(async move {
            let mut received = 0u64;
            let mut late = 0u64;
            let mut cutoff = None;
            while let Some(seq) = sub.recv().await {
                if cutoff.is_some_and(|cutoff| seq >= cutoff) {
                    late += 1;
                }
                received += 1;
                if cutoff.is_none() && close_after == Some(received) {
                    sub.close();
                    cutoff = Some(sequence.load(Ordering::SeqCst));
                }
            }
            Consumer {
                survivor: close_after.is_none(),
                received,
                late,
            }
        });
    }
    info!(subscribers = broadcaster.count(), "Subscribers registered");

    let start = Instant::now();
    let mut publishers = JoinSet::new();
    for p in 0..PUBLISHERS {
        let broadcaster = broadcaster.clone();
        let sequence = Arc::clone(&sequence);
        let share = pulses / PUBLISHERS + u64::from(p < pulses % PUBLISHERS);
        publishers.spawn(async move {
            for _ in 0..share {
                broadcaster.pulse(sequence.fetch_add(1, Ordering::SeqCst));
                tokio::task::yield_now().await;
            }
        });
    }
    while let Some(joined) = publishers.join_next().await {
        joined.context("Publisher task failed")?;
    }
    let published = start.elapsed();

    let stats = wait_settled(&broadcaster).await;
    let settled = start.elapsed();

    broadcaster.close_all();
    let mut survivors = 0u64;
    let mut closed = 0u64;
    let mut late = 0u64;
    let mut short = 0u64;
    while let Some(joined) = consumers.join_next().await {
        let consumer = joined.context("Consumer task failed")?;
        late += consumer.late;
        if consumer.survivor {
            survivors += 1;
            if consumer.received < pulses {
                short += 1;
            }
        } else {
            closed += 1;
        }
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while !broadcaster.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .context("Subscriptions were not torn down")?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Subscribers:          {:>10}                            ║", subscribers);
    println!("║  Closed early:         {:>10}                            ║", closed);
    println!("║  Survivors:            {:>10}                            ║", survivors);
    println!("║  Pulses:               {:>10}                            ║", stats.pulses);
    println!("║  Attempts:             {:>10}                            ║", stats.attempted);
    println!("║  Delivered:            {:>10}                            ║", stats.delivered);
    println!("║  Skipped:              {:>10}                            ║", stats.skipped);
    println!("║  Timed out:            {:>10}                            ║", stats.timed_out);
    println!(
        "║  Publish time:         {:>10.2}s                           ║",
        published.as_secs_f64()
    );
    println!(
        "║  Settle time:          {:>10.2}s                           ║",
        settled.as_secs_f64()
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    if late > 0 {
        bail!("{late} messages were delivered after their subscription closed");
    }
    if short > 0 && stats.timed_out == 0 {
        bail!("{short} surviving subscribers missed pulses without any timeout");
    }

    Ok(())
}
