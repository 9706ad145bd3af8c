use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strobe_core::{
    Broadcaster, BroadcasterConfig, CancellationToken, DeliveryPolicy, Subscription,
};
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::timeout;

async fn drained<T>(sub: &mut Subscription<T>) {
    while sub.recv().await.is_some() {}
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_listeners_receive_pulse() {
    let broadcaster = Broadcaster::<&'static str>::new();
    let mut listeners = JoinSet::new();

    for _ in 0..100 {
        let mut sub = broadcaster.subscribe();
        listeners.spawn(async move { sub.recv().await });
    }
    assert_eq!(broadcaster.count(), 100, "should be 100 listeners by now");

    // Listeners that register from their own tasks
    let ready = Arc::new(Barrier::new(5));
    for _ in 0..4 {
        let broadcaster = broadcaster.clone();
        let ready = Arc::clone(&ready);
        listeners.spawn(async move {
            let mut sub = broadcaster.subscribe();
            ready.wait().await;
            sub.recv().await
        });
    }
    ready.wait().await;
    assert_eq!(broadcaster.count(), 104);

    // A listener whose owner gave up before the pulse
    let forget = CancellationToken::new();
    let mut forgotten = broadcaster.subscribe_with(&forget);
    forget.cancel();

    broadcaster.pulse("PULSE");

    let all_received = timeout(Duration::from_secs(1), async {
        let mut received = 0;
        while let Some(joined) = listeners.join_next().await {
            assert_eq!(joined.unwrap(), Some("PULSE"));
            received += 1;
        }
        received
    })
    .await
    .expect("no pulse received");

    assert_eq!(all_received, 104);
    assert_eq!(forgotten.recv().await, None, "should not have sent on this channel");
}

#[tokio::test]
async fn closed_listener_yields_nothing() {
    let broadcaster = Broadcaster::<&'static str>::new();
    let mut sub = broadcaster.subscribe();
    sub.close();

    broadcaster.pulse("X");

    let next = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
    assert_eq!(next, None);
    assert!(broadcaster.is_empty());
}

#[tokio::test]
async fn never_read_subscriber_does_not_block_pulse() {
    let config = BroadcasterConfig::default()
        .with_delivery(DeliveryPolicy::bounded(Duration::from_millis(100)));
    let broadcaster = Broadcaster::<&'static str>::with_config(config);
    let _idle = broadcaster.subscribe();
    let mut active = broadcaster.subscribe();

    let start = Instant::now();
    broadcaster.pulse("first");
    broadcaster.pulse("second");
    assert!(start.elapsed() < Duration::from_millis(100));

    // The active subscriber keeps receiving while the idle one stalls
    let mut seen = vec![
        active.recv().await.unwrap(),
        active.recv().await.unwrap(),
    ];
    seen.sort_unstable();
    assert_eq!(seen, vec!["first", "second"]);

    wait_until(|| broadcaster.stats().timed_out == 1).await;
    assert_eq!(broadcaster.count(), 2);
}

#[tokio::test]
async fn unbounded_delivery_releases_on_close() {
    let config = BroadcasterConfig::default().with_delivery(DeliveryPolicy::Unbounded);
    let broadcaster = Broadcaster::<u32>::with_config(config);
    let mut idle = broadcaster.subscribe();

    let report = broadcaster.pulse_and_wait(1u32).await;
    assert_eq!(report.delivered, 1);
    broadcaster.pulse(2u32);

    idle.close();
    wait_until(|| broadcaster.stats().skipped == 1).await;

    assert_eq!(idle.recv().await, Some(1));
    assert_eq!(idle.recv().await, None);
    assert_eq!(broadcaster.stats().timed_out, 0);
}

#[tokio::test]
async fn count_tracks_subscribes_and_removals() {
    let broadcaster = Broadcaster::<u32>::new();
    let mut subs: Vec<_> = (0..10).map(|_| broadcaster.subscribe()).collect();
    assert_eq!(broadcaster.count(), 10);

    for sub in subs.iter_mut().take(4) {
        sub.close();
        drained(sub).await;
    }

    assert_eq!(broadcaster.count(), 6);
    let stats = broadcaster.stats();
    assert_eq!(stats.subscribed, 10);
    assert_eq!(stats.removed, 4);
    assert_eq!(stats.active, 6);
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let broadcaster = Broadcaster::<u32>::new();
    let keep = broadcaster.subscribe();
    let mut sub = broadcaster.subscribe();

    sub.close();
    sub.close();
    drained(&mut sub).await;
    sub.close();
    drop(sub);
    broadcaster.close_all();
    keep.close();

    wait_until(|| broadcaster.is_empty()).await;
    assert_eq!(broadcaster.stats().removed, 2);
}

#[tokio::test]
async fn late_subscriber_misses_earlier_pulse() {
    let broadcaster = Broadcaster::<u32>::new();
    let mut early = broadcaster.subscribe();

    let report = broadcaster.pulse_and_wait(1u32).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);

    let mut late = broadcaster.subscribe();
    assert!(late.try_recv().is_err());
    assert_eq!(early.recv().await, Some(1));

    broadcaster.pulse_and_wait(2u32).await;
    assert_eq!(early.recv().await, Some(2));
    assert_eq!(late.recv().await, Some(2));
}

#[tokio::test]
async fn subscription_as_stream() {
    use futures_util::StreamExt;

    let config = BroadcasterConfig::default().with_channel_capacity(4);
    let broadcaster = Broadcaster::<u32>::with_config(config);
    let mut sub = broadcaster.subscribe();

    for i in 0..3u32 {
        broadcaster.pulse_and_wait(i).await;
    }
    sub.close();

    let received: Vec<u32> = (&mut sub).collect().await;
    assert_eq!(received.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_delivery_after_close_under_load() {
    const SUBSCRIBERS: usize = 200;
    const PUBLISHERS: u64 = 8;
    const PULSES_PER_PUBLISHER: u64 = 250;
    const PULSES: u64 = PUBLISHERS * PULSES_PER_PUBLISHER;

    let config = BroadcasterConfig::default()
        .with_delivery(DeliveryPolicy::bounded(Duration::from_secs(10)));
    let broadcaster = Broadcaster::<u64>::with_config(config);
    let sequence = Arc::new(AtomicU64::new(0));

    let mut consumers = JoinSet::new();
    for i in 0..SUBSCRIBERS {
        let mut sub = broadcaster.subscribe();
        let sequence = Arc::clone(&sequence);
        // Half the subscribers close themselves after a random number of messages
        let close_after = (i % 2 == 0).then(|| rand::thread_rng().gen_range(1..PULSES / 2));

        consumers.spawn(async move {
            let mut received = 0u64;
            let mut cutoff = None;
            while let Some(seq) = sub.recv().await {
                if let Some(cutoff) = cutoff {
                    assert!(seq < cutoff, "message {seq} pulsed after close at {cutoff}");
                }
                received += 1;
                if cutoff.is_none() && close_after == Some(received) {
                    sub.close();
                    cutoff = Some(sequence.load(Ordering::SeqCst));
                }
            }
            (close_after.is_none(), received)
        });
    }
    assert_eq!(broadcaster.count(), SUBSCRIBERS);

    let mut publishers = JoinSet::new();
    for _ in 0..PUBLISHERS {
        let broadcaster = broadcaster.clone();
        let sequence = Arc::clone(&sequence);
        publishers.spawn(async move {
            for _ in 0..PULSES_PER_PUBLISHER {
                let seq = sequence.fetch_add(1, Ordering::SeqCst);
                broadcaster.pulse_and_wait(seq).await;
            }
        });
    }
    while let Some(joined) = publishers.join_next().await {
        joined.unwrap();
    }

    let stats = broadcaster.stats();
    assert_eq!(stats.pulses, PULSES);
    assert_eq!(stats.timed_out, 0);

    broadcaster.close_all();
    let mut survivors = 0;
    while let Some(joined) = consumers.join_next().await {
        let (survivor, received) = joined.unwrap();
        if survivor {
            survivors += 1;
            assert_eq!(received, PULSES);
        }
    }

    assert_eq!(survivors, SUBSCRIBERS / 2);
    wait_until(|| broadcaster.is_empty()).await;
    assert_eq!(broadcaster.stats().removed, SUBSCRIBERS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "full-scale load, run with --ignored"]
async fn no_delivery_after_close_with_racing_pulses() {
    const SUBSCRIBERS: usize = 1000;
    const PUBLISHERS: u64 = 10;
    const PULSES_PER_PUBLISHER: u64 = 1000;
    const PULSES: u64 = PUBLISHERS * PULSES_PER_PUBLISHER;
    const OPEN: u64 = u64::MAX;

    let config = BroadcasterConfig::default().with_delivery(DeliveryPolicy::Unbounded);
    let broadcaster = Broadcaster::<u64>::with_config(config);
    let sequence = Arc::new(AtomicU64::new(0));

    // Each subscriber is closed from outside its consumer through its own token
    let mut leases = Vec::with_capacity(SUBSCRIBERS);
    let mut consumers = JoinSet::new();
    for _ in 0..SUBSCRIBERS {
        let token = CancellationToken::new();
        let cutoff = Arc::new(AtomicU64::new(OPEN));
        let mut sub = broadcaster.subscribe_with(&token);
        consumers.spawn({
            let cutoff = Arc::clone(&cutoff);
            async move {
                let mut received = 0u64;
                let mut last = None;
                while let Some(seq) = sub.recv().await {
                    received += 1;
                    last = last.max(Some(seq));
                }
                (cutoff, received, last)
            }
        });
        leases.push((token, cutoff));
    }
    assert_eq!(broadcaster.count(), SUBSCRIBERS);

    let closer = {
        let sequence = Arc::clone(&sequence);
        let mut rng = StdRng::from_entropy();
        leases.retain(|_| rng.gen_bool(0.5));
        tokio::spawn(async move {
            for (token, cutoff) in leases {
                let pause = rng.gen_range(0..200);
                tokio::time::sleep(Duration::from_micros(pause)).await;
                token.cancel();
                cutoff.store(sequence.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        })
    };

    let mut publishers = JoinSet::new();
    for _ in 0..PUBLISHERS {
        let broadcaster = broadcaster.clone();
        let sequence = Arc::clone(&sequence);
        publishers.spawn(async move {
            for _ in 0..PULSES_PER_PUBLISHER {
                let seq = sequence.fetch_add(1, Ordering::SeqCst);
                broadcaster.pulse(seq);
                tokio::task::yield_now().await;
            }
        });
    }
    while let Some(joined) = publishers.join_next().await {
        joined.unwrap();
    }
    closer.await.unwrap();

    timeout(Duration::from_secs(60), async {
        loop {
            let stats = broadcaster.stats();
            if stats.delivered + stats.skipped + stats.timed_out >= stats.attempted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deliveries did not settle");
    assert_eq!(broadcaster.stats().pulses, PULSES);

    broadcaster.close_all();
    while let Some(joined) = consumers.join_next().await {
        let (cutoff, received, last) = joined.unwrap();
        let cutoff = cutoff.load(Ordering::SeqCst);
        if cutoff == OPEN {
            assert_eq!(received, PULSES);
        } else if let Some(last) = last {
            assert!(last < cutoff, "message {last} pulsed after close at {cutoff}");
        }
    }

    wait_until(|| broadcaster.is_empty()).await;
    assert_eq!(broadcaster.stats().removed, SUBSCRIBERS as u64);
}
