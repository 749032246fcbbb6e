//! Blocking executor: drives asynchronous BLE work from synchronous callers.
//!
//! One executor owns one tokio runtime with a single worker thread. The
//! worker is the event-driving loop: notification fan-out and other
//! background tasks run there, while callers park on [`BlockingExecutor::run_to_completion`]
//! until the operation they asked for resolves.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Explicit "wait" capability handed to protocol clients.
///
/// Implementations must keep background notification delivery running
/// while the caller waits.
pub trait Waiter: Send + Sync {
    fn sleep(&self, duration: Duration) -> Result<()>;
}

pub struct BlockingExecutor {
    handle: Handle,
    // Held only for lifetime and shutdown; all work goes through `handle`.
    runtime: Option<Runtime>,
}

impl BlockingExecutor {
    /// Build an executor with its own single-worker runtime
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("blesync-loop")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Executor(e.to_string()))?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Handle to the driving runtime
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `operation` to completion, blocking the calling thread.
    ///
    /// With `timeout` set, an operation still pending at the deadline is
    /// dropped and `TimedOut` is returned. May be called from plain threads
    /// and reentrantly from tasks running on this executor.
    pub fn run_to_completion<F>(&self, operation: F, timeout: Option<Duration>) -> Result<F::Output>
    where
        F: Future,
    {
        let bounded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, operation)
                    .await
                    .map_err(|_| BridgeError::TimedOut),
                None => Ok(operation.await),
            }
        };
        self.block_on(bounded)?
    }

    /// Advance background work for `duration` without awaiting anything in
    /// particular. Sleep-style waits must go through here.
    pub fn pump(&self, duration: Duration) -> Result<()> {
        debug!("Pumping executor for {:?}", duration);
        self.run_to_completion(tokio::time::sleep(duration), None)
    }

    /// Spawn a background task on the driving worker
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run blocking code `f` without stalling the runtime.
    ///
    /// On a runtime thread the worker's duties are handed off for the
    /// duration of `f`, so timers and notification delivery keep running.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        match Handle::try_current() {
            Err(_) => Ok(f()),
            Ok(current) => match current.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(BridgeError::Executor(
                    "cannot block inside a current-thread runtime".to_string(),
                )),
                _ => Ok(tokio::task::block_in_place(f)),
            },
        }
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        self.blocking(|| self.handle.block_on(future))
    }
}

impl Waiter for BlockingExecutor {
    fn sleep(&self, duration: Duration) -> Result<()> {
        self.pump(duration)
    }
}

impl Drop for BlockingExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Zero-timeout shutdown never blocks, so this is safe from async contexts
            runtime.shutdown_background();
        }
    }
}
