//! Error taxonomy shared by every layer of the runtime.

use crate::runtime::js_value::JSValue;
use std::thread::ThreadId;
use thiserror::Error;

/// Errors raised by handle, scope, dispatcher and promise operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A handle or scope-derived resource was used after it was released.
    #[error("{0} used after release")]
    UseAfterRelease(&'static str),

    /// An engine operation was attempted off the worker thread.
    #[error("{operation} called from thread {caller:?}, but the engine is owned by thread {owner:?}")]
    CrossThreadViolation {
        operation: &'static str,
        owner: ThreadId,
        caller: ThreadId,
    },

    /// The engine reported a failure for a call.
    #[error("{operation} failed: {message}")]
    ForeignOperation {
        operation: &'static str,
        message: String,
    },

    /// The engine allocator returned a null pointer.
    #[error("engine allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// A VM promise settled to the rejected state.
    #[error("promise rejected: {reason}")]
    PromiseRejected { reason: JSValue },

    /// A cancellation token fired before the awaited settlement.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Borrowed handles are owned by someone else and must not be released.
    #[error("borrowed handle cannot be released by its holder")]
    BorrowedRelease,

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("engine has been closed")]
    EngineClosed,

    #[error("work item panicked: {0}")]
    WorkPanicked(String),

    /// One or more releases failed while a scope was draining.
    #[error("{failed} release(s) failed during scope disposal; first error: {first}")]
    ScopeDisposal {
        first: Box<RuntimeError>,
        failed: usize,
    },

    #[error("value conversion failed: {0}")]
    Conversion(String),

    /// Error raised by host code running inside a work item or host function.
    #[error("{0}")]
    Host(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl RuntimeError {
    /// Wrap an arbitrary host error.
    pub fn host(err: impl std::fmt::Display) -> Self {
        RuntimeError::Host(err.to_string())
    }

    pub(crate) fn foreign(operation: &'static str, message: impl Into<String>) -> Self {
        RuntimeError::ForeignOperation {
            operation,
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        RuntimeError::WorkPanicked(message)
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
