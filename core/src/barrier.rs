/// Multi-source readiness barrier
///
/// Some peripherals announce their services as a burst of notifications on
/// several characteristics, in no guaranteed order. The barrier counts the
/// distinct characteristics that have reported at least once and lets a
/// caller block until a threshold is reached. The count is pushed by the
/// notification delivery path; nothing polls it.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::executor::BlockingExecutor;
use crate::transport::CharacteristicId;

pub struct ReadinessBarrier {
    seen: Mutex<HashSet<CharacteristicId>>,
    count: watch::Sender<usize>,
}

impl ReadinessBarrier {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            seen: Mutex::new(HashSet::new()),
            count,
        }
    }

    /// Record a notification from `id`. Returns true the first time `id` reports.
    pub fn observe(&self, id: &CharacteristicId) -> bool {
        let mut seen = self.seen.lock();
        if !seen.insert(id.clone()) {
            return false;
        }
        let total = seen.len();
        self.count.send_replace(total);
        debug!("Source {} reported ({} distinct)", id, total);
        true
    }

    /// Number of distinct sources seen so far
    pub fn seen(&self) -> usize {
        *self.count.borrow()
    }

    /// Distinct sources seen so far, sorted
    pub fn sources(&self) -> Vec<CharacteristicId> {
        let mut sources: Vec<_> = self.seen.lock().iter().cloned().collect();
        sources.sort();
        sources
    }

    /// Resolve once at least `needed` distinct sources have reported
    pub async fn ready(&self, needed: usize) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|seen| *seen >= needed).await;
    }

    /// Block on `executor` until `needed` sources have reported or `timeout` elapses
    pub fn wait(&self, executor: &BlockingExecutor, needed: usize, timeout: Duration) -> Result<()> {
        match executor.run_to_completion(self.ready(needed), Some(timeout)) {
            Ok(()) => Ok(()),
            Err(BridgeError::TimedOut) => Err(BridgeError::ReadinessTimeout {
                needed,
                seen: self.seen(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Forget every source
    pub fn reset(&self) {
        let mut seen = self.seen.lock();
        seen.clear();
        self.count.send_replace(0);
    }
}

impl Default for ReadinessBarrier {
    fn default() -> Self {
        Self::new()
    }
}
