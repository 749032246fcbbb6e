/// Latest-value notification buffering
///
/// Notifications usually arrive faster than a synchronous caller polls. Each
/// subscribed characteristic gets a bounded FIFO that drops its oldest
/// entries on overflow, plus a latest-known-value slot so a read always
/// answers with the freshest state the device has reported.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::config::DEFAULT_QUEUE_CAPACITY;
use crate::error::{BridgeError, Result};
use crate::executor::BlockingExecutor;
use crate::transport::CharacteristicId;

/// Outcome of a drain or read.
///
/// A zero-length notification is `Value(vec![])`, never `Empty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Bytes reported by the peripheral
    Value(Vec<u8>),
    /// Nothing available and nothing ever received
    Empty,
    /// Waited for the full timeout without a notification
    Timeout,
}

impl Payload {
    pub fn is_value(&self) -> bool {
        matches!(self, Payload::Value(_))
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Payload::Value(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Counters for one buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Notifications admitted
    pub received: u64,
    /// Entries dropped to make room
    pub evicted: u64,
    /// Entries currently queued
    pub queued: usize,
}

/// Bounded FIFO of raw payloads with oldest-first eviction
pub struct NotificationQueue {
    id: CharacteristicId,
    items: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    available: Notify,
    received: AtomicU64,
    evicted: AtomicU64,
}

impl NotificationQueue {
    pub fn new(id: CharacteristicId, capacity: usize) -> Self {
        Self {
            id,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
            received: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Admit `payload`, evicting oldest entries if full.
    ///
    /// Eviction is a single pass of at most `capacity` pops. Returns the
    /// number of evicted entries, or `QueueSaturated` if the payload still
    /// does not fit.
    pub fn push(&self, payload: Vec<u8>) -> Result<usize> {
        let mut items = self.items.lock();
        let mut evicted = 0;
        while items.len() >= self.capacity && evicted < self.capacity {
            items.pop_front();
            evicted += 1;
        }
        if items.len() >= self.capacity {
            return Err(BridgeError::QueueSaturated {
                characteristic: self.id.to_string(),
            });
        }
        items.push_back(payload);
        drop(items);

        self.received.fetch_add(1, Ordering::Relaxed);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        self.available.notify_one();
        Ok(evicted)
    }

    /// Pop the oldest entry without waiting
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.items.lock().pop_front()
    }

    /// Wait for and pop the oldest entry.
    ///
    /// Cancel-safe: the pop happens under the lock with no await in between,
    /// so dropping this future never loses an entry.
    pub async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(payload) = self.try_pop() {
                return payload;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the queued payloads, oldest first
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            received: self.received.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            queued: self.len(),
        }
    }
}

/// Per-characteristic queue plus latest-known value
pub struct LatestValueBuffer {
    queue: NotificationQueue,
    latest: Mutex<Option<Vec<u8>>>,
    saturated: Mutex<Option<BridgeError>>,
    executor: Arc<BlockingExecutor>,
}

impl LatestValueBuffer {
    pub fn new(id: CharacteristicId, capacity: usize, executor: Arc<BlockingExecutor>) -> Self {
        Self {
            queue: NotificationQueue::new(id, capacity),
            latest: Mutex::new(None),
            saturated: Mutex::new(None),
            executor,
        }
    }

    /// Create a buffer with the default capacity
    pub fn with_default_capacity(id: CharacteristicId, executor: Arc<BlockingExecutor>) -> Self {
        Self::new(id, DEFAULT_QUEUE_CAPACITY, executor)
    }

    /// Notification delivery path. Safe to call concurrently with readers.
    ///
    /// A saturation failure is returned here and also latched, so the next
    /// drain or read on this buffer reports it too.
    pub fn on_notify(&self, payload: &[u8]) -> Result<()> {
        match self.queue.push(payload.to_vec()) {
            Ok(0) => Ok(()),
            Ok(evicted) => {
                debug!(
                    "Queue for {} full, evicted {} oldest entr{}",
                    self.queue.id,
                    evicted,
                    if evicted == 1 { "y" } else { "ies" }
                );
                Ok(())
            }
            Err(err) => {
                error!("{} (sampling rate exceeds buffer capacity)", err);
                *self.saturated.lock() = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Pop the oldest queued payload, waiting up to `timeout`.
    ///
    /// A zero timeout never waits and reports `Empty`; a non-zero timeout
    /// that elapses reports `Timeout`.
    pub fn drain_one(&self, timeout: Duration) -> Result<Payload> {
        self.check_saturated()?;

        let popped = match self.queue.try_pop() {
            Some(payload) => Some(payload),
            None if timeout.is_zero() => None,
            None => match self
                .executor
                .run_to_completion(self.queue.pop(), Some(timeout))
            {
                Ok(payload) => Some(payload),
                Err(BridgeError::TimedOut) => None,
                Err(e) => return Err(e),
            },
        };

        match popped {
            Some(payload) => {
                *self.latest.lock() = Some(payload.clone());
                Ok(Payload::Value(payload))
            }
            None if timeout.is_zero() => Ok(Payload::Empty),
            None => Ok(Payload::Timeout),
        }
    }

    /// Drain the queue to its tail and answer with the freshest value.
    ///
    /// Only the first drain may wait for `timeout`; once a value has been
    /// popped the rest of the queue is drained without waiting. Falls back
    /// to the latest-known value, or `Empty` if nothing was ever received.
    pub fn read_latest(&self, timeout: Duration) -> Result<Payload> {
        let mut wait = timeout;
        while self.drain_one(wait)?.is_value() {
            wait = Duration::ZERO;
        }

        Ok(match self.latest() {
            Some(bytes) => Payload::Value(bytes),
            None => Payload::Empty,
        })
    }

    /// Most recently drained payload
    pub fn latest(&self) -> Option<Vec<u8>> {
        self.latest.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Queued payloads, oldest first
    pub fn queued(&self) -> Vec<Vec<u8>> {
        self.queue.snapshot()
    }

    pub fn stats(&self) -> BufferStats {
        self.queue.stats()
    }

    /// Discard queued payloads, the latest-known value and any saturation latch
    pub fn reset(&self) {
        self.queue.clear();
        *self.latest.lock() = None;
        *self.saturated.lock() = None;
    }

    fn check_saturated(&self) -> Result<()> {
        match self.saturated.lock().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn buffer(capacity: usize) -> LatestValueBuffer {
        let executor = Arc::new(BlockingExecutor::new().expect("Executor"));
        LatestValueBuffer::new(CharacteristicId::new("test-char"), capacity, executor)
    }

    #[test]
    fn test_queue_fifo_order() {
        let queue = NotificationQueue::new(CharacteristicId::new("q"), 10);
        queue.push(vec![0x01]).expect("Push 1");
        queue.push(vec![0x02]).expect("Push 2");
        queue.push(vec![0x03]).expect("Push 3");

        assert_eq!(queue.try_pop(), Some(vec![0x01]));
        assert_eq!(queue.try_pop(), Some(vec![0x02]));
        assert_eq!(queue.try_pop(), Some(vec![0x03]));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let buf = buffer(3);
        for payload in [b"a", b"b", b"c", b"d"] {
            buf.on_notify(payload).expect("Notify");
        }

        assert_eq!(buf.queued(), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(
            buf.read_latest(Duration::from_millis(100)).expect("Read"),
            Payload::Value(b"d".to_vec())
        );
    }

    #[test]
    fn test_overflow_stats() {
        let buf = buffer(2);
        for i in 0..5u8 {
            buf.on_notify(&[i]).expect("Notify");
        }

        let stats = buf.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.evicted, 3);
        assert_eq!(stats.queued, 2);
    }

    #[test]
    fn test_zero_capacity_saturates() {
        let buf = buffer(0);
        let result = buf.on_notify(b"x");
        assert!(matches!(result, Err(BridgeError::QueueSaturated { .. })));

        // Latched: the reader sees the failure too
        assert!(matches!(
            buf.drain_one(Duration::ZERO),
            Err(BridgeError::QueueSaturated { .. })
        ));

        buf.reset();
        assert_eq!(buf.drain_one(Duration::ZERO), Ok(Payload::Empty));
    }

    #[test]
    fn test_drain_one_never_notified_times_out() {
        let buf = buffer(10);
        let started = Instant::now();
        let result = buf.drain_one(Duration::from_millis(50)).expect("Drain");

        assert_eq!(result, Payload::Timeout);
        assert!(!result.is_value());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_drain_one_zero_timeout_is_empty() {
        let buf = buffer(10);
        assert_eq!(buf.drain_one(Duration::ZERO).expect("Drain"), Payload::Empty);
    }

    #[test]
    fn test_zero_length_payload_is_a_value() {
        let buf = buffer(10);
        buf.on_notify(&[]).expect("Notify");

        assert_eq!(
            buf.drain_one(Duration::from_millis(50)).expect("Drain"),
            Payload::Value(Vec::new())
        );
    }

    #[test]
    fn test_latest_value_persists_across_empty_drains() {
        let buf = buffer(10);
        buf.on_notify(b"x").expect("Notify");

        let first = buf.read_latest(Duration::from_millis(100)).expect("Read 1");
        let second = buf.read_latest(Duration::from_millis(100)).expect("Read 2");

        assert_eq!(first, Payload::Value(b"x".to_vec()));
        assert_eq!(second, Payload::Value(b"x".to_vec()));
    }

    #[test]
    fn test_read_latest_never_notified_is_empty() {
        let buf = buffer(10);
        assert_eq!(
            buf.read_latest(Duration::from_millis(20)).expect("Read"),
            Payload::Empty
        );
    }

    #[test]
    fn test_drain_wakes_on_concurrent_notify() {
        let executor = Arc::new(BlockingExecutor::new().expect("Executor"));
        let buf = Arc::new(LatestValueBuffer::new(
            CharacteristicId::new("c"),
            10,
            executor,
        ));

        let producer = buf.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.on_notify(b"late").expect("Notify");
        });

        let result = buf.drain_one(Duration::from_secs(2)).expect("Drain");
        handle.join().expect("Producer thread");
        assert_eq!(result, Payload::Value(b"late".to_vec()));
    }

    #[test]
    fn test_timed_out_drain_leaves_queue_consistent() {
        let buf = buffer(10);
        assert_eq!(buf.drain_one(Duration::from_millis(10)).expect("Drain"), Payload::Timeout);

        buf.on_notify(b"after").expect("Notify");
        assert_eq!(buf.len(), 1);
        assert_eq!(
            buf.drain_one(Duration::from_millis(10)).expect("Drain"),
            Payload::Value(b"after".to_vec())
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset_clears_latest() {
        let buf = buffer(4);
        buf.on_notify(b"v").expect("Notify");
        buf.read_latest(Duration::from_millis(10)).expect("Read");
        assert_eq!(buf.latest(), Some(b"v".to_vec()));

        buf.reset();
        assert_eq!(buf.latest(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_payload_into_value() {
        assert_eq!(Payload::Value(vec![1]).into_value(), Some(vec![1]));
        assert_eq!(Payload::Empty.into_value(), None);
        assert_eq!(Payload::Timeout.into_value(), None);
    }
}
