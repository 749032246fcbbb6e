//! Error taxonomy for the bridge layer.

use thiserror::Error;

/// Errors surfaced by the executor, buffers, devices and adapter.
///
/// Every failure is a distinct variant. "No data" is never an error and
/// never an empty payload: see [`crate::buffer::Payload`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Operation attempted while the device is not in the Connected state.
    #[error("Not connected")]
    NotConnected,
    /// Lifecycle operation requested from a state that does not allow it.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    /// A transport operation or drain exceeded its deadline.
    #[error("Operation timed out")]
    TimedOut,
    /// A notification could not be admitted after the bounded eviction pass.
    #[error("Notification queue saturated for characteristic {characteristic}")]
    QueueSaturated { characteristic: String },
    /// Fewer than `needed` distinct characteristics reported before the deadline.
    #[error("Readiness barrier unmet: {seen} of {needed} sources reported")]
    ReadinessTimeout { needed: usize, seen: usize },
    /// Failure reported by the underlying BLE stack.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The blocking executor could not be built or entered.
    #[error("Executor error: {0}")]
    Executor(String),
}

impl BridgeError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::TimedOut | BridgeError::ReadinessTimeout { .. } | BridgeError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
