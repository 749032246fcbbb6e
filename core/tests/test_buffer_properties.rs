//! Property-based tests for the latest-value buffer.
//! Arbitrary notification sequences against the queue bound and the latest-value answer.

use blesync_core::{BlockingExecutor, CharacteristicId, LatestValueBuffer, NotificationQueue, Payload};
use proptest::prelude::*;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

fn executor() -> Arc<BlockingExecutor> {
    static EXECUTOR: OnceLock<Arc<BlockingExecutor>> = OnceLock::new();
    EXECUTOR
        .get_or_init(|| Arc::new(BlockingExecutor::new().expect("Executor")))
        .clone()
}

fn payloads(max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 1..max_len)
}

proptest::proptest! {
    /// Within capacity, a read answers with the last payload delivered.
    #[test]
    fn read_latest_returns_last_within_capacity(
        capacity in 1usize..32,
        seed in payloads(32),
    ) {
        let burst: Vec<_> = seed.into_iter().take(capacity).collect();
        let buffer = LatestValueBuffer::new(CharacteristicId::new("c"), capacity, executor());
        for payload in &burst {
            buffer.on_notify(payload).expect("Admitted");
        }

        let last = burst.last().cloned().expect("Non-empty burst");
        prop_assert_eq!(buffer.read_latest(Duration::ZERO).expect("Read"), Payload::Value(last));
        prop_assert!(buffer.is_empty());
    }

    /// Past capacity, the queue stays bounded and the newest payload survives.
    #[test]
    fn overflow_keeps_bound_and_newest(
        capacity in 1usize..16,
        burst in payloads(64),
    ) {
        let buffer = LatestValueBuffer::new(CharacteristicId::new("c"), capacity, executor());
        for payload in &burst {
            buffer.on_notify(payload).expect("Admitted");
            prop_assert!(buffer.len() <= capacity);
        }

        let queued = buffer.queued();
        let tail_start = burst.len().saturating_sub(capacity);
        prop_assert_eq!(&queued[..], &burst[tail_start..]);

        let last = burst.last().cloned().expect("Non-empty burst");
        prop_assert_eq!(buffer.read_latest(Duration::ZERO).expect("Read"), Payload::Value(last));

        let stats = buffer.stats();
        prop_assert_eq!(stats.received, burst.len() as u64);
        prop_assert_eq!(stats.evicted, tail_start as u64);
    }

    /// Repeated reads after a burst keep answering with the same latest value.
    #[test]
    fn latest_value_is_sticky(burst in payloads(16), reads in 1usize..4) {
        let buffer = LatestValueBuffer::new(CharacteristicId::new("c"), 16, executor());
        for payload in &burst {
            buffer.on_notify(payload).expect("Admitted");
        }

        let last = burst.last().cloned().expect("Non-empty burst");
        for _ in 0..reads {
            prop_assert_eq!(
                buffer.read_latest(Duration::ZERO).expect("Read"),
                Payload::Value(last.clone())
            );
        }
    }

    /// The raw queue preserves arrival order for whatever it retains.
    #[test]
    fn queue_preserves_arrival_order(
        capacity in 1usize..16,
        burst in payloads(48),
    ) {
        let queue = NotificationQueue::new(CharacteristicId::new("c"), capacity);
        for payload in &burst {
            queue.push(payload.clone()).expect("Admitted");
        }

        let mut drained = Vec::new();
        while let Some(payload) = queue.try_pop() {
            drained.push(payload);
        }
        let tail_start = burst.len().saturating_sub(capacity);
        prop_assert_eq!(&drained[..], &burst[tail_start..]);
    }
}

#[test]
fn test_never_notified_drain_reports_marker_not_bytes() {
    let buffer = LatestValueBuffer::new(CharacteristicId::new("c"), 4, executor());

    assert_eq!(buffer.drain_one(Duration::ZERO).expect("Drain"), Payload::Empty);

    let started = std::time::Instant::now();
    assert_eq!(
        buffer.drain_one(Duration::from_millis(50)).expect("Drain"),
        Payload::Timeout
    );
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn test_zero_length_notification_is_a_value() {
    let buffer = LatestValueBuffer::new(CharacteristicId::new("c"), 4, executor());
    buffer.on_notify(&[]).expect("Admitted");
    assert_eq!(
        buffer.read_latest(Duration::ZERO).expect("Read"),
        Payload::Value(Vec::new())
    );
}
